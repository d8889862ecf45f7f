//! Graph layers
//!
//! Every operator of the decoder graph is one variant of [`Layer`]. A layer
//! reads its input tensors and writes its output tensors through the
//! registry-owned buffers; per-call parameters such as the block index and
//! the token position travel in an explicit [`Step`].
//!
//! Parameterized layers implement [`ParamLayer`] and hold weight tensors that
//! alias the mapped weight file.
//!
//! Reads and writes are checked per buffer: a layer may not read one view of
//! a buffer while writing another view of the same buffer. When an output is
//! the exact view of an input, the in-place kernel is used instead.

use std::fmt;

use crate::attention::{cpu::mha, rope::rope, GqaConfig};
use crate::error::{ForgeError, ForgeResult};
use crate::invariant_error;
use crate::kv_cache::KvCacheLayout;
use crate::mlp::kernels::{rmsnorm, rmsnorm_in_place, swiglu, swiglu_in_place, RMS_NORM_EPS};
use crate::model::embedding::embedding;
use crate::tensor::matmul::{matadd, matadd_assign, matmul};
use crate::tensor::{DataType, Tensor};

/// Discriminant of a [`Layer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Embedding,
    RmsNorm,
    MatMul,
    Rope,
    Add,
    SwiGlu,
    Attention,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerKind::Embedding => "embedding",
            LayerKind::RmsNorm => "rmsnorm",
            LayerKind::MatMul => "matmul",
            LayerKind::Rope => "rope",
            LayerKind::Add => "add",
            LayerKind::SwiGlu => "swiglu",
            LayerKind::Attention => "attention",
        };
        write!(f, "{}", name)
    }
}

/// Per-call parameters of a forward step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Step {
    /// Transformer block index
    pub layer: usize,
    /// Token position
    pub pos: usize,
}

impl Step {
    pub fn new(layer: usize, pos: usize) -> Self {
        Self { layer, pos }
    }
}

/// Layer that owns learned weights
pub trait ParamLayer {
    /// Number of weight slots
    fn slot_count(&self) -> usize;

    /// Install a weight tensor, returning the number of elements it covers
    ///
    /// The weight usually aliases the mapped weight file; the returned count
    /// advances the caller's running offset.
    fn set_weight(&mut self, slot: usize, weight: Tensor) -> ForgeResult<usize>;

    fn weight(&self, slot: usize) -> ForgeResult<&Tensor>;

    /// Whether every slot holds a weight
    fn is_complete(&self) -> bool;
}

/// Fixed table of weight slots with expected shapes
#[derive(Debug, Clone)]
struct WeightSlots {
    layer: String,
    shapes: Vec<Vec<usize>>,
    slots: Vec<Option<Tensor>>,
}

impl WeightSlots {
    fn new(layer: &str, shapes: Vec<Vec<usize>>) -> Self {
        let slots = vec![None; shapes.len()];
        Self {
            layer: layer.to_string(),
            shapes,
            slots,
        }
    }

    fn invalid_slot(&self, slot: usize) -> ForgeError {
        ForgeError::InvalidSlot {
            layer: self.layer.clone(),
            slot,
        }
    }

    fn set(&mut self, slot: usize, weight: Tensor) -> ForgeResult<usize> {
        let shape = self.shapes.get(slot).ok_or_else(|| self.invalid_slot(slot))?;
        if weight.dtype() != DataType::F32 {
            return Err(ForgeError::DtypeMismatch {
                actual: weight.dtype().to_string(),
                requested: DataType::F32.to_string(),
            });
        }
        // Flat tensors of the right size are accepted and given the slot shape.
        let weight = if weight.dims() == shape.as_slice() {
            weight
        } else {
            weight.reshape(shape).map_err(|_| {
                invariant_error!(
                    "{}: slot {} expects {:?}, got {:?}",
                    self.layer,
                    slot,
                    shape,
                    weight.dims()
                )
            })?
        };
        let consumed = weight.element_count();
        tracing::debug!(layer = %self.layer, slot, elements = consumed, "weight installed");
        self.slots[slot] = Some(weight);
        Ok(consumed)
    }

    fn get(&self, slot: usize) -> ForgeResult<&Tensor> {
        match self.slots.get(slot) {
            None => Err(self.invalid_slot(slot)),
            Some(None) => Err(ForgeError::MissingWeight {
                layer: self.layer.clone(),
                slot,
            }),
            Some(Some(t)) => Ok(t),
        }
    }

    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

/// Row lookup of token ids in a `[vocab_size, dim]` table
#[derive(Debug, Clone)]
pub struct EmbeddingLayer {
    vocab_size: usize,
    dim: usize,
    weights: WeightSlots,
}

impl EmbeddingLayer {
    pub fn new(vocab_size: usize, dim: usize) -> Self {
        Self {
            vocab_size,
            dim,
            weights: WeightSlots::new("embedding", vec![vec![vocab_size, dim]]),
        }
    }

    /// inputs: `[token_ids: i32]`, outputs: `[rows: [n, dim]]`
    fn forward(&self, inputs: &[&Tensor], outputs: &[&Tensor]) -> ForgeResult<()> {
        let weight = self.weights.get(0)?.read::<f32>()?;
        let ids = inputs[0].read::<i32>()?;
        let mut out = outputs[0].write::<f32>()?;
        embedding(&weight, self.vocab_size, self.dim, &ids, &mut out)
    }
}

/// Root-mean-square normalization with a learned scale
#[derive(Debug, Clone)]
pub struct RmsNormLayer {
    name: String,
    dim: usize,
    eps: f32,
    weights: WeightSlots,
}

impl RmsNormLayer {
    pub fn new(name: &str, dim: usize) -> Self {
        Self {
            name: name.to_string(),
            dim,
            eps: RMS_NORM_EPS,
            weights: WeightSlots::new(name, vec![vec![dim]]),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn forward(&self, inputs: &[&Tensor], outputs: &[&Tensor]) -> ForgeResult<()> {
        let weight = self.weights.get(0)?.read::<f32>()?;
        if outputs[0].shares_view_with(inputs[0]) {
            let mut data = outputs[0].write::<f32>()?;
            return rmsnorm_in_place(&weight, &mut data, self.eps);
        }
        let input = inputs[0].read::<f32>()?;
        let mut out = outputs[0].write::<f32>()?;
        rmsnorm(&weight, &input, &mut out, self.eps)
    }
}

/// `output = weight · input (+ bias)` with weight `[out_dim, in_dim]`
#[derive(Debug, Clone)]
pub struct MatMulLayer {
    name: String,
    in_dim: usize,
    out_dim: usize,
    weights: WeightSlots,
}

impl MatMulLayer {
    pub const WEIGHT: usize = 0;
    pub const BIAS: usize = 1;

    pub fn new(name: &str, in_dim: usize, out_dim: usize, has_bias: bool) -> Self {
        let mut shapes = vec![vec![out_dim, in_dim]];
        if has_bias {
            shapes.push(vec![out_dim]);
        }
        Self {
            name: name.to_string(),
            in_dim,
            out_dim,
            weights: WeightSlots::new(name, shapes),
        }
    }

    pub fn has_bias(&self) -> bool {
        self.weights.shapes.len() > Self::BIAS
    }

    /// inputs: `[x: [in_dim] | [in_dim, batch]]`, outputs: `[y: [out_dim] | [out_dim, batch]]`
    fn forward(&self, inputs: &[&Tensor], outputs: &[&Tensor]) -> ForgeResult<()> {
        let weight = self.weights.get(Self::WEIGHT)?.read::<f32>()?;
        let input = inputs[0].read::<f32>()?;
        let batch = if self.in_dim == 0 {
            1
        } else {
            input.len() / self.in_dim
        };
        let mut out = outputs[0].write::<f32>()?;
        matmul(&weight, self.out_dim, self.in_dim, &input, batch, &mut out, 1.0)?;

        if self.has_bias() {
            let bias = self.weights.get(Self::BIAS)?.read::<f32>()?;
            for (o, &b) in bias.iter().enumerate() {
                for value in &mut out[o * batch..(o + 1) * batch] {
                    *value += b;
                }
            }
        }
        Ok(())
    }
}

/// Rotary position embedding over query and key, in place
#[derive(Debug, Clone)]
pub struct RopeLayer {
    head_size: usize,
    weights: WeightSlots,
}

impl RopeLayer {
    pub const COS: usize = 0;
    pub const SIN: usize = 1;

    pub fn new(head_size: usize, context_length: usize) -> Self {
        let cache = vec![context_length, head_size / 2];
        Self {
            head_size,
            weights: WeightSlots::new("rope", vec![cache.clone(), cache]),
        }
    }

    /// inputs: `[query, key]`, rotated in place
    fn forward(&self, step: Step, inputs: &[&Tensor]) -> ForgeResult<()> {
        let cos = self.weights.get(Self::COS)?.read::<f32>()?;
        let sin = self.weights.get(Self::SIN)?.read::<f32>()?;
        let mut query = inputs[0].write::<f32>()?;
        let mut key = inputs[1].write::<f32>()?;
        rope(&mut query, &mut key, self.head_size, step.pos, &cos, &sin)
    }
}

/// Grouped-query attention over the whole KV cache
#[derive(Debug, Clone)]
pub struct AttentionLayer {
    gqa: GqaConfig,
    layout: KvCacheLayout,
}

impl AttentionLayer {
    pub fn new(gqa: GqaConfig, layout: KvCacheLayout) -> Self {
        Self { gqa, layout }
    }

    /// inputs: `[query, k_cache, v_cache]`, outputs: `[out, score]`
    fn forward(&self, step: Step, inputs: &[&Tensor], outputs: &[&Tensor]) -> ForgeResult<()> {
        let query = inputs[0].read::<f32>()?;
        let k_cache = inputs[1].read::<f32>()?;
        let v_cache = inputs[2].read::<f32>()?;
        let mut out = outputs[0].write::<f32>()?;
        let mut score = outputs[1].write::<f32>()?;
        mha(
            step.layer,
            step.pos,
            &self.gqa,
            &self.layout,
            &query,
            &k_cache,
            &v_cache,
            &mut score,
            &mut out,
        )
    }
}

/// Operator of the decoder graph
#[derive(Debug, Clone)]
pub enum Layer {
    Embedding(EmbeddingLayer),
    RmsNorm(RmsNormLayer),
    MatMul(MatMulLayer),
    Rope(RopeLayer),
    Add,
    SwiGlu,
    Attention(AttentionLayer),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Embedding(_) => LayerKind::Embedding,
            Layer::RmsNorm(_) => LayerKind::RmsNorm,
            Layer::MatMul(_) => LayerKind::MatMul,
            Layer::Rope(_) => LayerKind::Rope,
            Layer::Add => LayerKind::Add,
            Layer::SwiGlu => LayerKind::SwiGlu,
            Layer::Attention(_) => LayerKind::Attention,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Layer::RmsNorm(l) => &l.name,
            Layer::MatMul(l) => &l.name,
            Layer::Embedding(_) => "embedding",
            Layer::Rope(_) => "rope",
            Layer::Add => "add",
            Layer::SwiGlu => "swiglu",
            Layer::Attention(_) => "attention",
        }
    }

    /// Number of `(inputs, outputs)` the layer takes
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Layer::Embedding(_) | Layer::RmsNorm(_) | Layer::MatMul(_) => (1, 1),
            Layer::Rope(_) => (2, 0),
            Layer::Add | Layer::SwiGlu => (2, 1),
            Layer::Attention(_) => (3, 2),
        }
    }

    pub fn as_param(&self) -> Option<&dyn ParamLayer> {
        match self {
            Layer::Embedding(l) => Some(l),
            Layer::RmsNorm(l) => Some(l),
            Layer::MatMul(l) => Some(l),
            Layer::Rope(l) => Some(l),
            Layer::Add | Layer::SwiGlu | Layer::Attention(_) => None,
        }
    }

    pub fn as_param_mut(&mut self) -> Option<&mut dyn ParamLayer> {
        match self {
            Layer::Embedding(l) => Some(l),
            Layer::RmsNorm(l) => Some(l),
            Layer::MatMul(l) => Some(l),
            Layer::Rope(l) => Some(l),
            Layer::Add | Layer::SwiGlu | Layer::Attention(_) => None,
        }
    }

    fn check_arity(&self, inputs: &[&Tensor], outputs: &[&Tensor]) -> ForgeResult<()> {
        let (expected_inputs, expected_outputs) = self.arity();
        if inputs.len() != expected_inputs || outputs.len() != expected_outputs {
            return Err(ForgeError::InvalidArity {
                layer: self.name().to_string(),
                expected_inputs,
                expected_outputs,
                inputs: inputs.len(),
                outputs: outputs.len(),
            });
        }
        Ok(())
    }

    /// Run the operator
    pub fn forward(&self, step: Step, inputs: &[&Tensor], outputs: &[&Tensor]) -> ForgeResult<()> {
        self.check_arity(inputs, outputs)?;
        match self {
            Layer::Embedding(l) => l.forward(inputs, outputs),
            Layer::RmsNorm(l) => l.forward(inputs, outputs),
            Layer::MatMul(l) => l.forward(inputs, outputs),
            Layer::Rope(l) => l.forward(step, inputs),
            Layer::Add => add_forward(inputs, outputs),
            Layer::SwiGlu => swiglu_forward(inputs, outputs),
            Layer::Attention(l) => l.forward(step, inputs, outputs),
        }
    }
}

fn add_forward(inputs: &[&Tensor], outputs: &[&Tensor]) -> ForgeResult<()> {
    let (a, b, out) = (inputs[0], inputs[1], outputs[0]);
    if out.shares_view_with(a) {
        let other = b.read::<f32>()?;
        return matadd_assign(&mut out.write::<f32>()?, &other);
    }
    if out.shares_view_with(b) {
        let other = a.read::<f32>()?;
        return matadd_assign(&mut out.write::<f32>()?, &other);
    }
    let x = a.read::<f32>()?;
    let y = b.read::<f32>()?;
    matadd(&x, &y, &mut out.write::<f32>()?)
}

fn swiglu_forward(inputs: &[&Tensor], outputs: &[&Tensor]) -> ForgeResult<()> {
    let (gate, up, out) = (inputs[0], inputs[1], outputs[0]);
    if out.shares_view_with(gate) {
        let up = up.read::<f32>()?;
        return swiglu_in_place(&mut out.write::<f32>()?, &up);
    }
    let g = gate.read::<f32>()?;
    let u = up.read::<f32>()?;
    swiglu(&g, &u, &mut out.write::<f32>()?)
}

macro_rules! impl_param_layer {
    ($ty:ty) => {
        impl ParamLayer for $ty {
            fn slot_count(&self) -> usize {
                self.weights.shapes.len()
            }

            fn set_weight(&mut self, slot: usize, weight: Tensor) -> ForgeResult<usize> {
                self.weights.set(slot, weight)
            }

            fn weight(&self, slot: usize) -> ForgeResult<&Tensor> {
                self.weights.get(slot)
            }

            fn is_complete(&self) -> bool {
                self.weights.is_complete()
            }
        }
    };
}

impl_param_layer!(EmbeddingLayer);
impl_param_layer!(RmsNormLayer);
impl_param_layer!(MatMulLayer);
impl_param_layer!(RopeLayer);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Allocator, CpuAllocator};
    use std::sync::Arc;

    fn cpu() -> Arc<dyn Allocator> {
        Arc::new(CpuAllocator::new())
    }

    fn tensor(dims: &[usize], data: &[f32]) -> Tensor {
        Tensor::from_slice(dims, data, cpu()).unwrap()
    }

    #[test]
    fn test_set_weight_returns_element_count() {
        let mut layer = MatMulLayer::new("wq", 3, 2, true);
        assert_eq!(layer.slot_count(), 2);
        assert_eq!(layer.set_weight(0, tensor(&[6], &[0.0; 6])).unwrap(), 6);
        assert_eq!(layer.weight(0).unwrap().dims(), &[2, 3]);
        assert!(!layer.is_complete());
        assert_eq!(layer.set_weight(1, tensor(&[2], &[0.0; 2])).unwrap(), 2);
        assert!(layer.is_complete());
    }

    #[test]
    fn test_invalid_slot_fails_fast() {
        let mut layer = RmsNormLayer::new("input_norm", 4);
        let err = layer.set_weight(1, tensor(&[4], &[1.0; 4])).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidSlot { slot: 1, .. }));
        assert!(matches!(
            layer.weight(0),
            Err(ForgeError::MissingWeight { slot: 0, .. })
        ));
    }

    #[test]
    fn test_wrong_weight_size_rejected() {
        let mut layer = MatMulLayer::new("wo", 2, 2, false);
        assert!(matches!(
            layer.set_weight(0, tensor(&[3], &[0.0; 3])),
            Err(ForgeError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_arity_validated() {
        let layer = Layer::Add;
        let a = tensor(&[2], &[1.0, 2.0]);
        let err = layer.forward(Step::default(), &[&a], &[&a]).unwrap_err();
        assert!(matches!(
            err,
            ForgeError::InvalidArity {
                expected_inputs: 2,
                inputs: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_matmul_with_bias() {
        let mut layer = MatMulLayer::new("wk", 2, 2, true);
        layer.set_weight(0, tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0])).unwrap();
        layer.set_weight(1, tensor(&[2], &[0.5, -0.5])).unwrap();
        let layer = Layer::MatMul(layer);
        let x = tensor(&[2], &[1.0, 1.0]);
        let y = tensor(&[2], &[0.0, 0.0]);
        layer.forward(Step::default(), &[&x], &[&y]).unwrap();
        assert_eq!(y.to_vec::<f32>().unwrap(), vec![3.5, 6.5]);
    }

    #[test]
    fn test_matmul_missing_weight() {
        let layer = Layer::MatMul(MatMulLayer::new("wv", 2, 2, false));
        let x = tensor(&[2], &[1.0, 1.0]);
        let y = tensor(&[2], &[0.0, 0.0]);
        assert!(matches!(
            layer.forward(Step::default(), &[&x], &[&y]),
            Err(ForgeError::MissingWeight { .. })
        ));
    }

    #[test]
    fn test_add_in_place_on_either_side() {
        let a = tensor(&[2], &[1.0, 2.0]);
        let b = tensor(&[2], &[10.0, 20.0]);
        Layer::Add.forward(Step::default(), &[&a, &b], &[&a]).unwrap();
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![11.0, 22.0]);
        Layer::Add.forward(Step::default(), &[&b, &a], &[&a]).unwrap();
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![21.0, 42.0]);

        let out = tensor(&[2], &[0.0, 0.0]);
        Layer::Add.forward(Step::default(), &[&a, &b], &[&out]).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![31.0, 62.0]);
    }

    #[test]
    fn test_swiglu_in_place_matches_out_of_place() {
        let gate = tensor(&[3], &[0.5, -1.0, 2.0]);
        let up = tensor(&[3], &[1.0, 2.0, 3.0]);
        let out = tensor(&[3], &[0.0; 3]);
        Layer::SwiGlu.forward(Step::default(), &[&gate, &up], &[&out]).unwrap();
        Layer::SwiGlu.forward(Step::default(), &[&gate, &up], &[&gate]).unwrap();
        assert_eq!(gate.to_vec::<f32>().unwrap(), out.to_vec::<f32>().unwrap());
    }

    #[test]
    fn test_rmsnorm_in_place_on_alias() {
        let mut norm = RmsNormLayer::new("final_norm", 2);
        norm.set_weight(0, tensor(&[2], &[1.0, 1.0])).unwrap();
        let layer = Layer::RmsNorm(norm);
        let x = tensor(&[2], &[3.0, 4.0]);
        layer.forward(Step::default(), &[&x], &[&x]).unwrap();
        let v = x.to_vec::<f32>().unwrap();
        assert!((v[0] - 0.848_528_1).abs() < 1e-5);
        assert!((v[1] - 1.131_370_9).abs() < 1e-5);
    }

    #[test]
    fn test_embedding_layer() {
        let mut emb = EmbeddingLayer::new(3, 2);
        emb.set_weight(0, tensor(&[3, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]))
            .unwrap();
        let layer = Layer::Embedding(emb);
        let ids = Tensor::new(DataType::I32, &[1], cpu()).unwrap();
        ids.write::<i32>().unwrap()[0] = 2;
        let out = tensor(&[2], &[0.0, 0.0]);
        layer.forward(Step::default(), &[&ids], &[&out]).unwrap();
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![4.0, 5.0]);

        ids.write::<i32>().unwrap()[0] = 3;
        assert!(matches!(
            layer.forward(Step::default(), &[&ids], &[&out]),
            Err(ForgeError::TokenOutOfRange { token: 3, .. })
        ));
    }

    #[test]
    fn test_rope_layer_uses_step_position() {
        let mut rope = RopeLayer::new(2, 2);
        // pos 0: identity; pos 1: quarter turn
        rope.set_weight(RopeLayer::COS, tensor(&[2, 1], &[1.0, 0.0])).unwrap();
        rope.set_weight(RopeLayer::SIN, tensor(&[2, 1], &[0.0, 1.0])).unwrap();
        let layer = Layer::Rope(rope);
        let q = tensor(&[2], &[1.0, 2.0]);
        let k = tensor(&[2], &[3.0, 4.0]);
        layer.forward(Step::new(0, 0), &[&q, &k], &[]).unwrap();
        assert_eq!(q.to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
        layer.forward(Step::new(0, 1), &[&q, &k], &[]).unwrap();
        assert_eq!(q.to_vec::<f32>().unwrap(), vec![-2.0, 1.0]);
        assert_eq!(k.to_vec::<f32>().unwrap(), vec![-4.0, 3.0]);
    }

    #[test]
    fn test_layer_metadata() {
        let layer = Layer::MatMul(MatMulLayer::new("wq", 4, 4, true));
        assert_eq!(layer.kind(), LayerKind::MatMul);
        assert_eq!(layer.name(), "wq");
        assert_eq!(layer.arity(), (1, 1));
        assert!(layer.as_param().is_some());
        assert!(Layer::SwiGlu.as_param().is_none());
        assert_eq!(LayerKind::Attention.to_string(), "attention");
    }
}
