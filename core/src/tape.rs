// Wengert tape: reverse-mode AD via operation recording.
//
// Records operations during the forward pass into a linear tape, then replays
// them in reverse to compute gradients via the chain rule. The correlation
// kernel pair enters the tape as a registered opaque VJP block: the tape never
// looks inside it, it hands the upstream cost-volume gradient to the
// registered backward and accumulates what comes back.
//
// Opt-in: nothing is recorded unless with_tape() is called.
// Inputs are snapshotted at registration, immune to later mutation.

use std::cell::Cell;
use std::collections::HashMap;

use tracing::trace;

use crate::error::CorrelationError;

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers. Immutable after creation.
pub type BufId = usize;

/// A flat tensor buffer in the tape arena.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    /// Flat storage (row-major).
    pub data: Vec<f32>,
    /// Shape metadata, e.g. [B, C, H, W].
    pub shape: Vec<usize>,
}

impl TapeBuf {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Opaque VJP system ────────────────────────────────────────────────

/// Key identifying which opaque backward function to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpaqueKey {
    /// Local cross-correlation (cost volume), 2D or 3D.
    Correlation,
}

/// Backward function for an opaque block.
///
/// - `d_outputs`: upstream gradient for each output buffer
/// - `saved`: tensors saved during forward
/// - `d_inputs`: output, gradient for each input buffer (caller-allocated, zeroed)
pub type OpaqueBackwardFn = fn(
    d_outputs: &[&[f32]],
    saved: &[&[f32]],
    d_inputs: &mut [Vec<f32>],
);

/// Recording trait for types whose forward pass is opaque to the tape.
///
/// Implementations live in `opaque_adapters.rs` alongside the backward
/// adapters, which read back the saved-buffer layout written here.
pub trait OpaqueVjp {
    /// Which registry key maps to this type's backward adapter.
    fn opaque_key(&self) -> OpaqueKey;

    /// Run the forward pass on two tape buffers and record it.
    ///
    /// Pushes `TapeOp::Opaque` with this type's key and returns the BufId of
    /// the output. Fails without touching the tape if the forward pass
    /// rejects its inputs.
    fn record_on_tape(
        &self,
        tape: &mut Tape,
        input1: BufId,
        input2: BufId,
    ) -> Result<BufId, CorrelationError>;
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation on the tape.
#[derive(Debug, Clone)]
pub enum TapeOp {
    /// out = sum_i(A[i] * B[i])  (scalar)
    FrobeniusDot { a: BufId, b: BufId, out: BufId },
    /// out = A + B
    Add { a: BufId, b: BufId, out: BufId },
    /// out = A * B  (element-wise)
    Mul { a: BufId, b: BufId, out: BufId },
    /// out = scalar * A
    Scale { input: BufId, scalar: f32, out: BufId },
    /// Registered VJP block.
    Opaque {
        key: OpaqueKey,
        inputs: Vec<BufId>,
        outputs: Vec<BufId>,
        saved: Vec<BufId>,
    },
}

// ── The Tape ─────────────────────────────────────────────────────────

/// Wengert tape for reverse-mode AD.
///
/// Records operations during forward pass, replays in reverse for gradients.
/// Created via `with_tape()`, dropped after backward pass completes.
pub struct Tape {
    /// Operations in forward order. Replayed in reverse during backward.
    ops: Vec<TapeOp>,
    /// Arena of tensor buffers. Indexed by BufId.
    bufs: Vec<TapeBuf>,
    /// Gradient accumulators, indexed by BufId. None until backward seeds them.
    grad_accum: Vec<Option<Vec<f32>>>,
    /// True between creation and backward.
    recording: bool,
    /// Registry of opaque backward functions.
    opaque_registry: HashMap<OpaqueKey, OpaqueBackwardFn>,
}

impl Tape {
    /// Create a new empty tape with the given opaque VJP registry.
    pub fn new(registry: HashMap<OpaqueKey, OpaqueBackwardFn>) -> Self {
        Tape {
            ops: Vec::new(),
            bufs: Vec::new(),
            grad_accum: Vec::new(),
            recording: true,
            opaque_registry: registry,
        }
    }

    /// Create a tape with an empty registry (for testing standard ops only).
    pub fn new_empty() -> Self {
        Tape::new(HashMap::new())
    }

    // ── Buffer management ────────────────────────────────────────

    /// Allocate a new buffer in the arena. Returns its BufId.
    pub fn alloc(&mut self, data: Vec<f32>, shape: Vec<usize>) -> BufId {
        let id = self.bufs.len();
        self.bufs.push(TapeBuf::new(data, shape));
        self.grad_accum.push(None);
        id
    }

    /// Register an input buffer. CLONES the data.
    pub fn register_input(&mut self, data: &[f32], shape: Vec<usize>) -> BufId {
        self.alloc(data.to_vec(), shape)
    }

    pub fn buf_data(&self, id: BufId) -> &[f32] {
        &self.bufs[id].data
    }

    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.bufs[id].shape
    }

    pub fn buf_numel(&self, id: BufId) -> usize {
        self.bufs[id].numel()
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // ── Recording ────────────────────────────────────────────────

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Record an operation on the tape. Output buffers must already exist.
    pub fn record(&mut self, op: TapeOp) {
        assert!(self.recording, "Tape::record called but tape is not recording");
        self.ops.push(op);
    }

    /// Allocate the output buffer and record the op that produces it.
    /// Returns the output BufId.
    pub fn record_with_output(&mut self, data: Vec<f32>, shape: Vec<usize>,
                              op_fn: impl FnOnce(BufId) -> TapeOp) -> BufId {
        let out_id = self.alloc(data, shape);
        let op = op_fn(out_id);
        self.record(op);
        out_id
    }

    /// True when a backward function is registered for `key`.
    pub fn has_opaque(&self, key: OpaqueKey) -> bool {
        self.opaque_registry.contains_key(&key)
    }

    /// Record an opaque block. Inputs, outputs and saved must already be allocated.
    pub fn record_opaque(&mut self, key: OpaqueKey, inputs: Vec<BufId>,
                         outputs: Vec<BufId>, saved: Vec<BufId>) {
        assert!(self.opaque_registry.contains_key(&key),
                "No opaque backward registered for {:?}", key);
        trace!(?key, ?inputs, ?outputs, n_saved = saved.len(), "recording opaque block");
        self.record(TapeOp::Opaque { key, inputs, outputs, saved });
    }

    // ── Gradient seeding and access ──────────────────────────────

    /// Seed the gradient for a buffer (typically the loss).
    pub fn seed_grad(&mut self, id: BufId, grad: Vec<f32>) {
        assert_eq!(grad.len(), self.bufs[id].numel(),
                   "Gradient size mismatch: grad={} buf={}", grad.len(), self.bufs[id].numel());
        self.grad_accum[id] = Some(grad);
    }

    fn accumulate_grad(&mut self, id: BufId, grad: &[f32]) {
        let n = self.bufs[id].numel();
        assert_eq!(grad.len(), n, "accumulate_grad size mismatch: grad={} buf={}", grad.len(), n);
        match &mut self.grad_accum[id] {
            Some(existing) => {
                for (e, g) in existing.iter_mut().zip(grad.iter()) {
                    *e += g;
                }
            }
            None => {
                self.grad_accum[id] = Some(grad.to_vec());
            }
        }
    }

    /// Accumulated gradient for a buffer, or None if no gradient flowed to it.
    pub fn get_grad(&self, id: BufId) -> Option<&[f32]> {
        self.grad_accum[id].as_deref()
    }

    /// Gradient for a buffer, zeros if no gradient flowed.
    pub fn get_grad_or_zeros(&self, id: BufId) -> Vec<f32> {
        match &self.grad_accum[id] {
            Some(g) => g.clone(),
            None => vec![0.0; self.bufs[id].numel()],
        }
    }

    // ── Backward pass ────────────────────────────────────────────

    /// Replay ops in reverse, computing VJPs. A scalar loss is seeded with
    /// 1.0 if `seed_grad` was not called.
    pub fn backward(&mut self, loss_id: BufId) {
        self.recording = false;

        if self.grad_accum[loss_id].is_none() {
            assert_eq!(self.bufs[loss_id].numel(), 1,
                       "Auto-seeding only works for scalar loss (got {} elements)",
                       self.bufs[loss_id].numel());
            self.grad_accum[loss_id] = Some(vec![1.0]);
        }

        trace!(n_ops = self.ops.len(), loss_id, "tape backward");
        for op_idx in (0..self.ops.len()).rev() {
            let op = self.ops[op_idx].clone();
            self.backward_op(&op);
        }
    }

    fn backward_op(&mut self, op: &TapeOp) {
        match op {
            // ── FrobeniusDot: out = <A, B> (scalar) ──────────────
            TapeOp::FrobeniusDot { a, b, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let scalar = d_out[0];
                    let d_a: Vec<f32> = self.bufs[*b].data.iter().map(|x| scalar * x).collect();
                    self.accumulate_grad(*a, &d_a);
                    let d_b: Vec<f32> = self.bufs[*a].data.iter().map(|x| scalar * x).collect();
                    self.accumulate_grad(*b, &d_b);
                }
            }

            // ── Add: out = A + B ─────────────────────────────────
            TapeOp::Add { a, b, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    self.accumulate_grad(*a, &d_out);
                    self.accumulate_grad(*b, &d_out);
                }
            }

            // ── Mul: out = A * B (element-wise) ──────────────────
            TapeOp::Mul { a, b, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d_a: Vec<f32> = d_out.iter().zip(self.bufs[*b].data.iter())
                        .map(|(d, b)| d * b).collect();
                    self.accumulate_grad(*a, &d_a);
                    let d_b: Vec<f32> = d_out.iter().zip(self.bufs[*a].data.iter())
                        .map(|(d, a)| d * a).collect();
                    self.accumulate_grad(*b, &d_b);
                }
            }

            // ── Scale: out = scalar * A ──────────────────────────
            TapeOp::Scale { input, scalar, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d_input: Vec<f32> = d_out.iter().map(|d| *scalar * d).collect();
                    self.accumulate_grad(*input, &d_input);
                }
            }

            // ── Opaque: registered VJP block ─────────────────────
            TapeOp::Opaque { key, inputs, outputs, saved } => {
                let d_outputs: Vec<Vec<f32>> = outputs.iter().map(|&oid| {
                    self.grad_accum[oid].clone().unwrap_or_else(|| vec![0.0; self.bufs[oid].numel()])
                }).collect();
                let d_out_refs: Vec<&[f32]> = d_outputs.iter().map(|v| v.as_slice()).collect();

                let saved_data: Vec<Vec<f32>> = saved.iter().map(|&sid| {
                    self.bufs[sid].data.clone()
                }).collect();
                let saved_refs: Vec<&[f32]> = saved_data.iter().map(|v| v.as_slice()).collect();

                let mut d_inputs: Vec<Vec<f32>> = inputs.iter().map(|&iid| {
                    vec![0.0f32; self.bufs[iid].numel()]
                }).collect();

                let backward_fn = self.opaque_registry[key];
                backward_fn(&d_out_refs, &saved_refs, &mut d_inputs);

                for (iid, d_inp) in inputs.iter().zip(d_inputs.iter()) {
                    self.accumulate_grad(*iid, d_inp);
                }
            }
        }
    }
}

// ── Thread-local tape access (opt-in) ────────────────────────────────

thread_local! {
    static TAPE_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Drop guard that clears the TAPE_ACTIVE flag when scope exits, including
/// on panic. Ensures `is_tape_active()` is never left stale.
struct TapeGuard;

impl Drop for TapeGuard {
    fn drop(&mut self) {
        TAPE_ACTIVE.with(|flag| flag.set(false));
    }
}

/// Execute a closure with an active tape. `is_tape_active()` returns true for
/// the duration of `f`; the flag is cleared by a drop guard on return or panic.
pub fn with_tape<F, R>(registry: HashMap<OpaqueKey, OpaqueBackwardFn>, f: F) -> R
where
    F: FnOnce(&mut Tape) -> R,
{
    TAPE_ACTIVE.with(|flag| {
        debug_assert!(!flag.get(), "nested with_tape() calls are not supported");
        flag.set(true);
    });

    let _guard = TapeGuard;
    let mut tape = Tape::new(registry);
    f(&mut tape)
}

/// Execute with an empty opaque registry (for testing standard ops only).
pub fn with_tape_empty<F, R>(f: F) -> R
where
    F: FnOnce(&mut Tape) -> R,
{
    with_tape(HashMap::new(), f)
}

/// True only while inside a `with_tape()` closure on this thread.
pub fn is_tape_active() -> bool {
    TAPE_ACTIVE.with(|flag| flag.get())
}

// ── Tests ────────────────────────────────────────────────────────────
