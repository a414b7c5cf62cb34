use inferport_core::{
    broadcast_shapes, fc_input_dims, ActivationFunction, Backend, BackendCapabilities, BackendId,
    Error, LayerKind, Result, Shape, TensorDescriptor, TensorRef,
};
use tracing::trace;

/// Host-memory backend that runs every compute layer kind.
///
/// It is the fallback of last resort: any validated graph can be placed on it.
pub struct RefBackend;

impl RefBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RefBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for RefBackend {
    fn id(&self) -> BackendId {
        BackendId::CPU_REF
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::HOST
    }

    fn check_support(
        &self,
        layer: &LayerKind,
        _inputs: &[&TensorDescriptor],
        _output: &TensorDescriptor,
    ) -> std::result::Result<(), String> {
        if layer.is_compute() {
            Ok(())
        } else {
            Err(format!("{} is not a compute layer", layer.name()))
        }
    }

    fn execute(
        &self,
        layer: &LayerKind,
        inputs: &[TensorRef<'_>],
        output: &mut [f32],
        output_desc: &TensorDescriptor,
    ) -> Result<()> {
        if inputs.len() != layer.num_inputs() {
            return Err(Error::Execution(format!(
                "{} expects {} inputs, got {}",
                layer.name(),
                layer.num_inputs(),
                inputs.len()
            )));
        }
        if output.len() != output_desc.num_elements() {
            return Err(Error::Execution(format!(
                "{} output buffer holds {} values, shape {} needs {}",
                layer.name(),
                output.len(),
                output_desc.shape,
                output_desc.num_elements()
            )));
        }
        trace!(layer = layer.name(), out = %output_desc.shape, "ref kernel");

        match layer {
            LayerKind::FullyConnected {
                transpose_weights,
                bias_enabled,
            } => {
                let bias = if *bias_enabled {
                    Some(inputs[2].data)
                } else {
                    None
                };
                fully_connected(inputs[0], inputs[1], bias, *transpose_weights, output)
            }
            LayerKind::Addition => {
                elementwise(inputs[0], inputs[1], output_desc, output, |a, b| a + b)
            }
            LayerKind::Multiplication => {
                elementwise(inputs[0], inputs[1], output_desc, output, |a, b| a * b)
            }
            LayerKind::Activation(f) => {
                for (dst, &x) in output.iter_mut().zip(inputs[0].data) {
                    *dst = activate(*f, x);
                }
                Ok(())
            }
            LayerKind::Softmax { beta } => softmax(inputs[0], *beta, output),
            LayerKind::Reshape { .. } => {
                if inputs[0].data.len() != output.len() {
                    return Err(Error::Execution(format!(
                        "cannot reshape {} into {}",
                        inputs[0].desc.shape, output_desc.shape
                    )));
                }
                output.copy_from_slice(inputs[0].data);
                Ok(())
            }
            LayerKind::Input | LayerKind::Output | LayerKind::Constant(_) => Err(Error::Execution(
                format!("{} is not a compute layer", layer.name()),
            )),
        }
    }
}

fn fully_connected(
    input: TensorRef<'_>,
    weights: TensorRef<'_>,
    bias: Option<&[f32]>,
    transpose: bool,
    output: &mut [f32],
) -> Result<()> {
    let (batch, k) = fc_input_dims(&input.desc.shape);
    let w = weights.desc.shape.dims();
    let [w0, w1] = w else {
        return Err(Error::Execution(format!(
            "FullyConnected weights must be rank 2, got {}",
            weights.desc.shape
        )));
    };
    let m = if transpose { *w0 } else { *w1 };
    if output.len() != batch * m || weights.data.len() != k * m {
        return Err(Error::Execution(format!(
            "FullyConnected operands {} x {} do not fit output of {} values",
            input.desc.shape,
            weights.desc.shape,
            output.len()
        )));
    }

    for n in 0..batch {
        let row = &input.data[n * k..(n + 1) * k];
        for j in 0..m {
            let mut acc = bias.map_or(0.0, |b| b[j]);
            for (i, x) in row.iter().enumerate() {
                let wij = if transpose {
                    weights.data[j * k + i]
                } else {
                    weights.data[i * m + j]
                };
                acc += x * wij;
            }
            output[n * m + j] = acc;
        }
    }
    Ok(())
}

fn elementwise(
    a: TensorRef<'_>,
    b: TensorRef<'_>,
    out_desc: &TensorDescriptor,
    output: &mut [f32],
    op: impl Fn(f32, f32) -> f32,
) -> Result<()> {
    let out_shape = broadcast_shapes(&a.desc.shape, &b.desc.shape)
        .filter(|s| s.numel() == out_desc.num_elements())
        .ok_or_else(|| {
            Error::Execution(format!(
                "cannot broadcast {} and {} into {}",
                a.desc.shape, b.desc.shape, out_desc.shape
            ))
        })?;

    if a.data.len() == output.len() && b.data.len() == output.len() {
        for ((dst, x), y) in output.iter_mut().zip(a.data).zip(b.data) {
            *dst = op(*x, *y);
        }
        return Ok(());
    }

    for (idx, dst) in output.iter_mut().enumerate() {
        let x = a.data[broadcast_source(idx, &out_shape, &a.desc.shape)];
        let y = b.data[broadcast_source(idx, &out_shape, &b.desc.shape)];
        *dst = op(x, y);
    }
    Ok(())
}

/// Maps a flat index of the broadcast result to the flat index of one operand.
fn broadcast_source(mut idx: usize, out: &Shape, src: &Shape) -> usize {
    let out_dims = out.dims();
    let src_dims = src.dims();
    let offset = out_dims.len() - src_dims.len();
    let mut src_idx = 0;
    let mut stride = 1;
    for axis in (0..out_dims.len()).rev() {
        let coord = idx % out_dims[axis];
        idx /= out_dims[axis];
        if axis >= offset {
            let dim = src_dims[axis - offset];
            if dim != 1 {
                src_idx += coord * stride;
            }
            stride *= dim;
        }
    }
    src_idx
}

fn activate(f: ActivationFunction, x: f32) -> f32 {
    match f {
        ActivationFunction::ReLu => x.max(0.0),
        ActivationFunction::BoundedReLu { upper, lower } => x.max(lower).min(upper),
        ActivationFunction::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        ActivationFunction::TanH => x.tanh(),
        ActivationFunction::Linear { a, b } => a * x + b,
    }
}

fn softmax(input: TensorRef<'_>, beta: f32, output: &mut [f32]) -> Result<()> {
    let axis = *input
        .desc
        .shape
        .dims()
        .last()
        .ok_or_else(|| Error::Execution("softmax over a rank 0 tensor".to_string()))?;
    for (src, dst) in input.data.chunks(axis).zip(output.chunks_mut(axis)) {
        let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for (d, &x) in dst.iter_mut().zip(src) {
            *d = ((x - max) * beta).exp();
            sum += *d;
        }
        for d in dst.iter_mut() {
            *d /= sum;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use inferport_core::DType;

    use super::*;

    fn t(dims: &[usize], data: &[f32]) -> (TensorDescriptor, Vec<f32>) {
        (TensorDescriptor::new(dims, DType::F32), data.to_vec())
    }

    fn run(layer: LayerKind, inputs: &[(TensorDescriptor, Vec<f32>)], out: &[usize]) -> Vec<f32> {
        let refs: Vec<TensorRef<'_>> = inputs
            .iter()
            .map(|(desc, data)| TensorRef { desc, data })
            .collect();
        let out_desc = TensorDescriptor::new(out, DType::F32);
        let mut output = vec![0.0; out_desc.num_elements()];
        RefBackend::new()
            .execute(&layer, &refs, &mut output, &out_desc)
            .unwrap();
        output
    }

    #[test]
    fn fully_connected_identity() {
        let fc = LayerKind::FullyConnected {
            transpose_weights: false,
            bias_enabled: false,
        };
        let out = run(fc, &[t(&[1, 1], &[3.0]), t(&[1, 1], &[1.0])], &[1, 1]);
        assert_eq!(out, vec![3.0]);
    }

    #[test]
    fn fully_connected_with_transposed_weights_and_bias() {
        let fc = LayerKind::FullyConnected {
            transpose_weights: true,
            bias_enabled: true,
        };
        // weights [M=2, K=3]
        let out = run(
            fc,
            &[
                t(&[1, 3], &[1.0, 2.0, 3.0]),
                t(&[2, 3], &[1.0, 0.0, 0.0, 0.0, 1.0, 1.0]),
                t(&[2], &[0.5, -1.0]),
            ],
            &[1, 2],
        );
        assert_eq!(out, vec![1.5, 4.0]);
    }

    #[test]
    fn addition_broadcasts_rows() {
        let out = run(
            LayerKind::Addition,
            &[t(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), t(&[3], &[10.0, 20.0, 30.0])],
            &[2, 3],
        );
        assert_eq!(out, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn multiplication_broadcasts_columns() {
        let out = run(
            LayerKind::Multiplication,
            &[t(&[2, 2], &[1.0, 2.0, 3.0, 4.0]), t(&[2, 1], &[2.0, -1.0])],
            &[2, 2],
        );
        assert_eq!(out, vec![2.0, 4.0, -3.0, -4.0]);
    }

    #[test]
    fn activations() {
        let relu = run(
            LayerKind::Activation(ActivationFunction::ReLu),
            &[t(&[3], &[-1.0, 0.0, 2.0])],
            &[3],
        );
        assert_eq!(relu, vec![0.0, 0.0, 2.0]);

        let bounded = run(
            LayerKind::Activation(ActivationFunction::BoundedReLu {
                upper: 1.0,
                lower: -1.0,
            }),
            &[t(&[3], &[-5.0, 0.5, 5.0])],
            &[3],
        );
        assert_eq!(bounded, vec![-1.0, 0.5, 1.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let out = run(
            LayerKind::Softmax { beta: 1.0 },
            &[t(&[2, 3], &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0])],
            &[2, 3],
        );
        for row in out.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert!(out[2] > out[1] && out[1] > out[0]);
        assert!((out[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn non_compute_layers_are_rejected() {
        let desc = TensorDescriptor::new([1], DType::F32);
        assert!(RefBackend::new()
            .check_support(&LayerKind::Input, &[], &desc)
            .is_err());
    }
}
