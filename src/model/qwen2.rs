//! Qwen2 decoder graph
//!
//! Loading walks the weight file in its fixed order, installs every weight
//! into its layer without copying, and allocates the registry-resident
//! scratch and cache tensors once. Each forward step then runs the blocks
//! strictly in sequence over those shared tensors:
//!
//! ```text
//! input ─ rmsnorm ─ q/k/v ─ rope ─ attention ─ o_proj ─ (+) ─ rmsnorm ─ gate/up ─ swiglu ─ down ─ (+)
//! ```
//!
//! followed by the final norm, the classifier and the sampler.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::invariant_error;
use crate::kv_cache::KvCache;
use crate::loader::{WeightCursor, WeightFile};
use crate::memory::Allocator;
use crate::model::config::TransformerConfig;
use crate::model::layer::{
    AttentionLayer, EmbeddingLayer, Layer, MatMulLayer, ParamLayer, RmsNormLayer, RopeLayer,
    Step,
};
use crate::model::registry::{BufferKey, BufferRegistry};
use crate::sampler::Sampler;
use crate::tensor::{DataType, Tensor};

/// Lifecycle of a model instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    /// Constructed, weights not yet mapped
    Uninitialized,
    /// Weights mapped and buffers allocated; no token processed this session
    Loaded,
    /// Mid-session; `next_pos` is the next KV cache position to fill
    Generating { next_pos: usize },
}

/// Parameterized layers of one transformer block
#[derive(Debug)]
struct DecoderBlock {
    input_norm: Layer,
    wq: Layer,
    wk: Layer,
    wv: Layer,
    wo: Layer,
    post_norm: Layer,
    gate: Layer,
    down: Layer,
    up: Layer,
}

impl DecoderBlock {
    fn new(config: &TransformerConfig, index: usize) -> Self {
        let (dim, hidden, kv_dim) = (config.dim, config.hidden_dim, config.kv_dim);
        let named = |what: &str| format!("layers.{}.{}", index, what);
        Self {
            input_norm: Layer::RmsNorm(RmsNormLayer::new(&named("input_norm"), dim)),
            wq: Layer::MatMul(MatMulLayer::new(&named("wq"), dim, dim, true)),
            wk: Layer::MatMul(MatMulLayer::new(&named("wk"), dim, kv_dim, true)),
            wv: Layer::MatMul(MatMulLayer::new(&named("wv"), dim, kv_dim, true)),
            wo: Layer::MatMul(MatMulLayer::new(&named("wo"), dim, dim, false)),
            post_norm: Layer::RmsNorm(RmsNormLayer::new(&named("post_norm"), dim)),
            gate: Layer::MatMul(MatMulLayer::new(&named("gate"), dim, hidden, false)),
            down: Layer::MatMul(MatMulLayer::new(&named("down"), hidden, dim, false)),
            up: Layer::MatMul(MatMulLayer::new(&named("up"), dim, hidden, false)),
        }
    }

    fn layers(&self) -> [&Layer; 9] {
        [
            &self.input_norm,
            &self.wq,
            &self.wk,
            &self.wv,
            &self.wo,
            &self.post_norm,
            &self.gate,
            &self.down,
            &self.up,
        ]
    }
}

/// Fail if any parameterized layer is missing a weight
fn ensure_weights_complete<'a>(layers: impl IntoIterator<Item = &'a Layer>) -> ForgeResult<()> {
    for layer in layers {
        if let Some(param) = layer.as_param() {
            if !param.is_complete() {
                return Err(invariant_error!("layer '{}' is missing weights after load", layer.name()));
            }
        }
    }
    Ok(())
}

/// Everything that exists once the weights are loaded
#[derive(Debug)]
struct Graph {
    config: TransformerConfig,
    /// Keeps the mapping alive; weight tensors also hold it.
    _weights: Rc<WeightFile>,
    registry: BufferRegistry,
    kv_cache: KvCache,
    embedding: Layer,
    blocks: Vec<DecoderBlock>,
    final_norm: Layer,
    rope: Layer,
    classifier: Layer,
    add: Layer,
    swiglu: Layer,
    attention: Layer,
}

/// Qwen2 decoder-only model
#[derive(Debug)]
pub struct Qwen2Model {
    path: PathBuf,
    allocator: Arc<dyn Allocator>,
    sampler: Sampler,
    state: ModelState,
    graph: Option<Graph>,
}

/// Install the next `dims` weight from the cursor into `slot` of `layer`
fn load_weight(
    cursor: &mut WeightCursor,
    layer: &mut Layer,
    slot: usize,
    dims: &[usize],
) -> ForgeResult<()> {
    let name = layer.name().to_string();
    let param = layer
        .as_param_mut()
        .ok_or_else(|| invariant_error!("layer '{}' has no weights", name))?;
    let weight = cursor.peek(dims)?;
    let consumed = param.set_weight(slot, weight)?;
    cursor.advance(consumed);
    Ok(())
}

impl Qwen2Model {
    /// Model for the weight file at `path`; nothing is read until [`init`](Self::init)
    pub fn new(path: impl AsRef<Path>, allocator: Arc<dyn Allocator>, sampler: Sampler) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            allocator,
            sampler,
            state: ModelState::Uninitialized,
            graph: None,
        }
    }

    /// Construct and initialize in one step
    pub fn load(
        path: impl AsRef<Path>,
        allocator: Arc<dyn Allocator>,
        sampler: Sampler,
    ) -> ForgeResult<Self> {
        let mut model = Self::new(path, allocator, sampler);
        model.init()?;
        Ok(model)
    }

    /// Map the weights, build the graph and allocate all buffers
    pub fn init(&mut self) -> ForgeResult<()> {
        if self.graph.is_some() {
            return Ok(());
        }
        let graph = self.build_graph()?;
        self.graph = Some(graph);
        self.state = ModelState::Loaded;
        Ok(())
    }

    fn build_graph(&self) -> ForgeResult<Graph> {
        let file = WeightFile::open(&self.path)?;
        let config = TransformerConfig::from_header(file.header())?;
        let gqa = config.gqa();

        tracing::info!(
            path = %self.path.display(),
            dim = config.dim,
            hidden_dim = config.hidden_dim,
            layers = config.layer_count,
            vocab_size = config.vocab_size,
            context_length = config.context_length,
            freq_cache_size = config.freq_cache_size(),
            shared_embedding = config.shared_token_embedding,
            "loading qwen2 model"
        );
        tracing::info!(
            heads = gqa.head_num,
            kv_heads = gqa.kv_head_num,
            group_members = gqa.mem_num(),
            head_size = gqa.head_size,
            "grouped-query attention"
        );

        let (dim, hidden, kv_dim) = (config.dim, config.hidden_dim, config.kv_dim);
        let (vocab, ctx, half) = (config.vocab_size, config.context_length, config.freq_cache_size());
        let mut cursor = WeightCursor::new(Rc::clone(&file));

        let mut embedding = Layer::Embedding(EmbeddingLayer::new(vocab, dim));
        load_weight(&mut cursor, &mut embedding, 0, &[vocab, dim])?;

        let mut blocks: Vec<DecoderBlock> = (0..config.layer_count)
            .map(|i| DecoderBlock::new(&config, i))
            .collect();

        for block in &mut blocks {
            load_weight(&mut cursor, &mut block.input_norm, 0, &[dim])?;
        }
        for block in &mut blocks {
            load_weight(&mut cursor, &mut block.wq, MatMulLayer::WEIGHT, &[dim, dim])?;
            load_weight(&mut cursor, &mut block.wq, MatMulLayer::BIAS, &[dim])?;
        }
        for block in &mut blocks {
            load_weight(&mut cursor, &mut block.wk, MatMulLayer::WEIGHT, &[kv_dim, dim])?;
            load_weight(&mut cursor, &mut block.wk, MatMulLayer::BIAS, &[kv_dim])?;
        }
        for block in &mut blocks {
            load_weight(&mut cursor, &mut block.wv, MatMulLayer::WEIGHT, &[kv_dim, dim])?;
            load_weight(&mut cursor, &mut block.wv, MatMulLayer::BIAS, &[kv_dim])?;
        }
        for block in &mut blocks {
            load_weight(&mut cursor, &mut block.wo, MatMulLayer::WEIGHT, &[dim, dim])?;
        }
        for block in &mut blocks {
            load_weight(&mut cursor, &mut block.post_norm, 0, &[dim])?;
        }
        for block in &mut blocks {
            load_weight(&mut cursor, &mut block.gate, MatMulLayer::WEIGHT, &[hidden, dim])?;
        }
        for block in &mut blocks {
            load_weight(&mut cursor, &mut block.down, MatMulLayer::WEIGHT, &[dim, hidden])?;
        }
        for block in &mut blocks {
            load_weight(&mut cursor, &mut block.up, MatMulLayer::WEIGHT, &[hidden, dim])?;
        }

        let mut final_norm = Layer::RmsNorm(RmsNormLayer::new("final_norm", dim));
        load_weight(&mut cursor, &mut final_norm, 0, &[dim])?;

        let mut rope = Layer::Rope(RopeLayer::new(config.head_size, ctx));
        load_weight(&mut cursor, &mut rope, RopeLayer::COS, &[ctx, half])?;
        load_weight(&mut cursor, &mut rope, RopeLayer::SIN, &[ctx, half])?;

        let mut classifier = MatMulLayer::new("classifier", dim, vocab, false);
        if config.shared_token_embedding {
            let shared = embedding
                .as_param()
                .ok_or_else(|| invariant_error!("embedding layer has no weights"))?
                .weight(0)?
                .clone();
            classifier.set_weight(MatMulLayer::WEIGHT, shared)?;
        }
        let mut classifier = Layer::MatMul(classifier);
        if !config.shared_token_embedding {
            load_weight(&mut cursor, &mut classifier, MatMulLayer::WEIGHT, &[vocab, dim])?;
        }

        cursor.finish()?;
        ensure_weights_complete(
            [&embedding, &final_norm, &rope, &classifier]
                .into_iter()
                .chain(blocks.iter().flat_map(DecoderBlock::layers)),
        )?;
        tracing::debug!(
            consumed_bytes = cursor.consumed_bytes(),
            "weight file fully consumed"
        );

        let (registry, kv_cache) = self.allocate_buffers(&config)?;
        let attention = Layer::Attention(AttentionLayer::new(gqa, *kv_cache.layout()));

        Ok(Graph {
            config,
            _weights: file,
            registry,
            kv_cache,
            embedding,
            blocks,
            final_norm,
            rope,
            classifier,
            add: Layer::Add,
            swiglu: Layer::SwiGlu,
            attention,
        })
    }

    fn allocate_buffers(&self, config: &TransformerConfig) -> ForgeResult<(BufferRegistry, KvCache)> {
        let alloc = || Arc::clone(&self.allocator);
        let f32_tensor = |dims: &[usize]| Tensor::new(DataType::F32, dims, alloc());
        let mut registry = BufferRegistry::new();

        registry.insert(BufferKey::TokenId, Tensor::new(DataType::I32, &[1], alloc())?)?;
        registry.insert(BufferKey::EmbeddingInput, f32_tensor(&[config.dim])?)?;

        let rms = f32_tensor(&[config.dim])?;
        registry.insert(BufferKey::RmsNorm, rms.clone())?;
        registry.insert(BufferKey::Mha, rms.clone())?;
        registry.insert(BufferKey::Down, rms)?;

        registry.insert(BufferKey::Gate, f32_tensor(&[config.hidden_dim])?)?;
        registry.insert(BufferKey::Up, f32_tensor(&[config.hidden_dim])?)?;

        let kv_cache = KvCache::new(config.kv_cache_layout(), alloc())?;
        registry.insert(BufferKey::KCache, kv_cache.keys().clone())?;
        registry.insert(BufferKey::VCache, kv_cache.values().clone())?;

        let query = f32_tensor(&[config.dim])?;
        registry.insert(BufferKey::Query, query.clone())?;
        registry.insert(BufferKey::AttnOutput, query)?;

        registry.insert(
            BufferKey::Score,
            f32_tensor(&[config.q_head_count, config.context_length])?,
        )?;
        registry.insert(BufferKey::Logits, f32_tensor(&[config.vocab_size])?)?;

        Ok((registry, kv_cache))
    }

    fn graph(&self) -> ForgeResult<&Graph> {
        self.graph.as_ref().ok_or(ForgeError::ModelNotLoaded)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn config(&self) -> ForgeResult<&TransformerConfig> {
        Ok(&self.graph()?.config)
    }

    pub fn registry(&self) -> ForgeResult<&BufferRegistry> {
        Ok(&self.graph()?.registry)
    }

    pub fn kv_cache(&self) -> ForgeResult<&KvCache> {
        Ok(&self.graph()?.kv_cache)
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn set_sampler(&mut self, sampler: Sampler) {
        self.sampler = sampler;
    }

    /// Position the next [`forward`](Self::forward) must use
    pub fn next_position(&self) -> ForgeResult<usize> {
        match self.state {
            ModelState::Uninitialized => Err(ForgeError::ModelNotLoaded),
            ModelState::Loaded => Ok(0),
            ModelState::Generating { next_pos } => Ok(next_pos),
        }
    }

    /// Start a new session at position 0
    pub fn reset(&mut self) -> ForgeResult<()> {
        self.graph()?.kv_cache.clear()?;
        self.state = ModelState::Loaded;
        Ok(())
    }

    /// Embed `token` into the embedding-input tensor and return that tensor
    pub fn fill_input(&self, token: usize) -> ForgeResult<Tensor> {
        let graph = self.graph()?;
        let token_ids = graph.registry.get(BufferKey::TokenId)?;
        let input = graph.registry.get(BufferKey::EmbeddingInput)?;

        let id = i32::try_from(token).map_err(|_| ForgeError::TokenOutOfRange {
            token,
            vocab_size: graph.config.vocab_size,
        })?;
        token_ids.write::<i32>()?[0] = id;
        graph
            .embedding
            .forward(Step::default(), &[token_ids], &[input])?;
        Ok(input.clone())
    }

    /// Run every block for the token embedded in `input` at `pos`, then the
    /// classifier, and sample the next token id.
    ///
    /// `pos` must be the next unfilled cache position of the session.
    pub fn forward(&mut self, input: &Tensor, pos: usize) -> ForgeResult<usize> {
        let expected = self.next_position()?;
        // Field borrow so the sampler stays mutably reachable.
        let graph = self.graph.as_ref().ok_or(ForgeError::ModelNotLoaded)?;
        let config = &graph.config;

        if pos >= config.context_length {
            return Err(ForgeError::ContextExhausted {
                pos,
                context_length: config.context_length,
            });
        }
        if pos != expected {
            return Err(ForgeError::InvalidPosition { pos, expected });
        }
        if input.dtype() != DataType::F32 || input.element_count() != config.dim {
            return Err(invariant_error!(
                "forward: input is {} {:?}, expected f32 [{}]",
                input.dtype(),
                input.dims(),
                config.dim
            ));
        }

        let _span = tracing::trace_span!("forward", pos).entered();
        for layer in 0..config.layer_count {
            Self::run_block(graph, Step::new(layer, pos), input)?;
        }

        let registry = &graph.registry;
        let logits = registry.get(BufferKey::Logits)?;
        graph.final_norm.forward(Step::default(), &[input], &[input])?;
        graph.classifier.forward(Step::default(), &[input], &[logits])?;

        let next = {
            let values = logits.read::<f32>()?;
            self.sampler.sample(&values)?
        };
        self.state = ModelState::Generating { next_pos: pos + 1 };
        tracing::trace!(pos, next, "forward step complete");
        Ok(next)
    }

    fn run_block(graph: &Graph, step: Step, input: &Tensor) -> ForgeResult<()> {
        let block = &graph.blocks[step.layer];
        let registry = &graph.registry;
        let rms = registry.get(BufferKey::RmsNorm)?;
        let mha_out = registry.get(BufferKey::Mha)?;
        let down = registry.get(BufferKey::Down)?;
        let query = registry.get(BufferKey::Query)?;
        let attn_out = registry.get(BufferKey::AttnOutput)?;
        let gate = registry.get(BufferKey::Gate)?;
        let up = registry.get(BufferKey::Up)?;
        let score = registry.get(BufferKey::Score)?;
        let k_cache = registry.get(BufferKey::KCache)?;
        let v_cache = registry.get(BufferKey::VCache)?;
        let (key, value) = graph.kv_cache.slice(step.layer, step.pos)?;

        tracing::trace!(layer = step.layer, pos = step.pos, "decoder block");

        // Attention
        block.input_norm.forward(step, &[input], &[rms])?;
        block.wq.forward(step, &[rms], &[query])?;
        block.wk.forward(step, &[rms], &[&key])?;
        block.wv.forward(step, &[rms], &[&value])?;
        graph.rope.forward(step, &[query, &key], &[])?;
        graph
            .attention
            .forward(step, &[query, k_cache, v_cache], &[mha_out, score])?;
        block.wo.forward(step, &[mha_out], &[attn_out])?;
        graph.add.forward(step, &[input, attn_out], &[input])?;

        // Feed-forward
        block.post_norm.forward(step, &[input], &[rms])?;
        block.gate.forward(step, &[rms], &[gate])?;
        block.up.forward(step, &[rms], &[up])?;
        graph.swiglu.forward(step, &[gate, up], &[gate])?;
        block.down.forward(step, &[gate], &[down])?;
        graph.add.forward(step, &[down, input], &[input])?;
        Ok(())
    }

    /// Embed `token` and run [`forward`](Self::forward) at `pos`
    pub fn step(&mut self, token: usize, pos: usize) -> ForgeResult<usize> {
        let input = self.fill_input(token)?;
        self.forward(&input, pos)
    }

    /// Copy of the logits from the last forward step
    pub fn logits(&self) -> ForgeResult<Vec<f32>> {
        self.graph()?.registry.get(BufferKey::Logits)?.to_vec::<f32>()
    }
}
