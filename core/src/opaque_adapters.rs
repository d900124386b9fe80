// Opaque VJP adapter: bridge between the tape's flat-buffer interface and the
// typed correlation kernels.
//
// Recording runs the forward pass on two tape buffers and pushes one opaque
// block. Backward reconstructs the volumes and geometry from the saved
// buffers, calls the backward orchestrator, and writes both input gradients.
//
// Saved buffer layout:
//   saved[0] = metadata: [rank, shape1.., shape2.., kernel_size.., patch_size..,
//              padding.., dilation.., dilation_patch.., stride..]
//              (rank = 4 or 5, each geometry field has rank - 2 entries)
//   saved[1] = input1 data
//   saved[2] = input2 data
//
// d_outputs[0] = upstream cost-volume gradient
// d_inputs[0] = d_input1, d_inputs[1] = d_input2

use std::collections::HashMap;

use tracing::{error, trace};

use crate::backward::correlation_backward;
use crate::error::CorrelationError;
use crate::forward::correlation_forward;
use crate::geometry::{CorrelationConfig, Geometry};
use crate::tape::{BufId, OpaqueBackwardFn, OpaqueKey, OpaqueVjp, Tape};
use crate::tensor::Volume;

// ── Metadata encoding ─────────────────────────────────────────────────

/// Encode both input shapes and the geometry as exact small integers in f32.
pub fn encode_correlation_meta(shape1: &[usize], shape2: &[usize], cfg: &CorrelationConfig) -> Vec<f32> {
    let mut meta = Vec::with_capacity(1 + shape1.len() + shape2.len() + 6 * cfg.kernel_size.len());
    meta.push(shape1.len() as f32);
    for field in [
        shape1,
        shape2,
        &cfg.kernel_size,
        &cfg.patch_size,
        &cfg.padding,
        &cfg.dilation,
        &cfg.dilation_patch,
        &cfg.stride,
    ] {
        meta.extend(field.iter().map(|&v| v as f32));
    }
    meta
}

fn meta_usize(v: f32) -> Option<usize> {
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 {
        Some(v as usize)
    } else {
        None
    }
}

/// Inverse of [`encode_correlation_meta`].
pub fn decode_correlation_meta(
    meta: &[f32],
) -> Result<(Vec<usize>, Vec<usize>, CorrelationConfig), CorrelationError> {
    let malformed = || CorrelationError::Config(format!("malformed correlation metadata: {meta:?}"));

    let values: Vec<usize> = meta.iter().map(|&v| meta_usize(v)).collect::<Option<_>>().ok_or_else(malformed)?;
    let (&rank, rest) = values.split_first().ok_or_else(malformed)?;
    if rank != 4 && rank != 5 {
        return Err(malformed());
    }
    let spatial = rank - 2;
    if rest.len() != 2 * rank + 6 * spatial {
        return Err(malformed());
    }

    let (shape1, rest) = rest.split_at(rank);
    let (shape2, params) = rest.split_at(rank);
    let field = |i: usize| params[i * spatial..(i + 1) * spatial].to_vec();
    let cfg = CorrelationConfig {
        kernel_size: field(0),
        patch_size: field(1),
        padding: field(2),
        dilation: field(3),
        dilation_patch: field(4),
        stride: field(5),
    };
    Ok((shape1.to_vec(), shape2.to_vec(), cfg))
}

// ── Recording ─────────────────────────────────────────────────────────

/// Run the correlation forward on tape buffers `input1` and `input2` and
/// record it as an opaque block. Returns the cost-volume BufId.
///
/// Inputs are read as [B, C, H, W] or [B, C, H, W, D] using their tape
/// shapes. On error nothing is allocated or recorded, including when the
/// tape has no backward registered for [`OpaqueKey::Correlation`].
pub fn record_correlation(
    tape: &mut Tape,
    input1: BufId,
    input2: BufId,
    cfg: &CorrelationConfig,
) -> Result<BufId, CorrelationError> {
    if !tape.has_opaque(OpaqueKey::Correlation) {
        return Err(CorrelationError::Config(
            "tape has no backward registered for the correlation block".into(),
        ));
    }
    let v1 = Volume::from_vec(tape.buf_data(input1).to_vec(), tape.buf_shape(input1))?;
    let v2 = Volume::from_vec(tape.buf_data(input2).to_vec(), tape.buf_shape(input2))?;
    let cost = correlation_forward(&v1, &v2, cfg)?;

    let meta = encode_correlation_meta(v1.shape(), v2.shape(), cfg);
    let meta_len = meta.len();
    let cost_shape = cost.shape().to_vec();
    trace!(input1, input2, cost_shape = ?cost_shape, "recording correlation");

    let out = tape.alloc(cost.into_vec(), cost_shape);
    let meta_id = tape.alloc(meta, vec![meta_len]);
    // Tape buffers are immutable after creation, so the inputs double as saved data.
    tape.record_opaque(OpaqueKey::Correlation, vec![input1, input2], vec![out], vec![meta_id, input1, input2]);
    Ok(out)
}

impl OpaqueVjp for CorrelationConfig {
    fn opaque_key(&self) -> OpaqueKey {
        OpaqueKey::Correlation
    }

    fn record_on_tape(
        &self,
        tape: &mut Tape,
        input1: BufId,
        input2: BufId,
    ) -> Result<BufId, CorrelationError> {
        record_correlation(tape, input1, input2, self)
    }
}

// ── Backward adapter ──────────────────────────────────────────────────

fn correlation_input_grads(
    d_outputs: &[&[f32]],
    saved: &[&[f32]],
) -> Result<(Volume<f32>, Volume<f32>), CorrelationError> {
    let (&[d_cost], &[meta, data1, data2]) = (d_outputs, saved) else {
        return Err(CorrelationError::Config(format!(
            "correlation block expects 1 output and 3 saved buffers, got {} and {}",
            d_outputs.len(),
            saved.len()
        )));
    };
    let (shape1, shape2, cfg) = decode_correlation_meta(meta)?;
    let geom = Geometry::resolve(&shape1, &shape2, &cfg)?;
    let input1 = Volume::from_vec(data1.to_vec(), &shape1)?;
    let input2 = Volume::from_vec(data2.to_vec(), &shape2)?;
    let grad_output = Volume::from_vec(d_cost.to_vec(), &geom.cost_volume_shape())?;
    correlation_backward(&input1, &input2, &grad_output, &cfg)
}

/// Correlation opaque backward adapter. Undecodable saved data is logged and
/// leaves `d_inputs` untouched (zero).
pub fn correlation_opaque_backward(
    d_outputs: &[&[f32]],
    saved: &[&[f32]],
    d_inputs: &mut [Vec<f32>],
) {
    if d_inputs.len() != 2 {
        error!(n_inputs = d_inputs.len(), "correlation opaque backward expects 2 inputs");
        return;
    }
    match correlation_input_grads(d_outputs, saved) {
        Ok((grad1, grad2)) => {
            d_inputs[0] = grad1.into_vec();
            d_inputs[1] = grad2.into_vec();
        }
        Err(err) => {
            error!(%err, "correlation opaque backward failed; input gradients left zero");
        }
    }
}

// ── Registry builder ──────────────────────────────────────────────────

/// Opaque VJP registry mapping every OpaqueKey to its backward adapter.
pub fn register_opaque_vjps() -> HashMap<OpaqueKey, OpaqueBackwardFn> {
    let mut registry = HashMap::new();
    registry.insert(OpaqueKey::Correlation, correlation_opaque_backward as OpaqueBackwardFn);
    registry
}

// ── Tests ─────────────────────────────────────────────────────────────
