//! Plain forward pass over a flat weight vector
//!
//! Written independently of the engine's layers and buffers so integration
//! tests can compare logits against it.

use qwenforge::loader::ModelHeader;
use qwenforge::model::TransformerConfig;

const EPS: f32 = 1e-6;

struct Block {
    input_norm: Vec<f32>,
    wq: Vec<f32>,
    bq: Vec<f32>,
    wk: Vec<f32>,
    bk: Vec<f32>,
    wv: Vec<f32>,
    bv: Vec<f32>,
    wo: Vec<f32>,
    post_norm: Vec<f32>,
    gate: Vec<f32>,
    down: Vec<f32>,
    up: Vec<f32>,
}

pub struct ReferenceModel {
    pub config: TransformerConfig,
    embedding: Vec<f32>,
    blocks: Vec<Block>,
    final_norm: Vec<f32>,
    cos: Vec<f32>,
    sin: Vec<f32>,
    classifier: Vec<f32>,
    keys: Vec<Vec<Vec<f32>>>,
    values: Vec<Vec<Vec<f32>>>,
}

struct Reader<'a> {
    data: &'a [f32],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Vec<f32> {
        let out = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        out
    }
}

fn matvec(w: &[f32], x: &[f32], rows: usize) -> Vec<f32> {
    let cols = x.len();
    (0..rows)
        .map(|r| w[r * cols..(r + 1) * cols].iter().zip(x).map(|(a, b)| a * b).sum())
        .collect()
}

fn rmsnorm(x: &[f32], w: &[f32]) -> Vec<f32> {
    let mean = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let inv = 1.0 / (mean + EPS).sqrt();
    x.iter().zip(w).map(|(v, g)| v * inv * g).collect()
}

fn rotate(x: &mut [f32], head_size: usize, cos: &[f32], sin: &[f32]) {
    let half = head_size / 2;
    for head in x.chunks_mut(head_size) {
        for g in 0..half {
            let (a, b) = (head[g], head[g + half]);
            head[g] = a * cos[g] - b * sin[g];
            head[g + half] = a * sin[g] + b * cos[g];
        }
    }
}

impl ReferenceModel {
    pub fn new(header: &ModelHeader, weights: &[f32]) -> anyhow::Result<Self> {
        let config = TransformerConfig::from_header(header)?;
        let (d, h, v, kv) = (config.dim, config.hidden_dim, config.vocab_size, config.kv_dim);
        let l = config.layer_count;
        let half = config.head_size / 2;
        let mut r = Reader { data: weights, pos: 0 };

        let embedding = r.take(v * d);
        let input_norms: Vec<_> = (0..l).map(|_| r.take(d)).collect();
        let q: Vec<_> = (0..l).map(|_| (r.take(d * d), r.take(d))).collect();
        let k: Vec<_> = (0..l).map(|_| (r.take(kv * d), r.take(kv))).collect();
        let vv: Vec<_> = (0..l).map(|_| (r.take(kv * d), r.take(kv))).collect();
        let wo: Vec<_> = (0..l).map(|_| r.take(d * d)).collect();
        let post: Vec<_> = (0..l).map(|_| r.take(d)).collect();
        let gate: Vec<_> = (0..l).map(|_| r.take(h * d)).collect();
        let down: Vec<_> = (0..l).map(|_| r.take(d * h)).collect();
        let up: Vec<_> = (0..l).map(|_| r.take(h * d)).collect();
        let final_norm = r.take(d);
        let cos = r.take(config.context_length * half);
        let sin = r.take(config.context_length * half);
        let classifier = if config.shared_token_embedding {
            embedding.clone()
        } else {
            r.take(v * d)
        };
        anyhow::ensure!(r.pos == weights.len(), "unused reference weights");

        let mut blocks = Vec::with_capacity(l);
        for i in 0..l {
            blocks.push(Block {
                input_norm: input_norms[i].clone(),
                wq: q[i].0.clone(),
                bq: q[i].1.clone(),
                wk: k[i].0.clone(),
                bk: k[i].1.clone(),
                wv: vv[i].0.clone(),
                bv: vv[i].1.clone(),
                wo: wo[i].clone(),
                post_norm: post[i].clone(),
                gate: gate[i].clone(),
                down: down[i].clone(),
                up: up[i].clone(),
            });
        }

        Ok(Self {
            config,
            embedding,
            blocks,
            final_norm,
            cos,
            sin,
            classifier,
            keys: vec![Vec::new(); l],
            values: vec![Vec::new(); l],
        })
    }

    /// Logits for `token` appended at the next position
    pub fn forward(&mut self, token: usize) -> Vec<f32> {
        let c = self.config;
        let (d, kv, hs) = (c.dim, c.kv_dim, c.head_size);
        let pos = self.keys[0].len();
        let half = hs / 2;
        let cos = &self.cos[pos * half..(pos + 1) * half];
        let sin = &self.sin[pos * half..(pos + 1) * half];

        let mut x = self.embedding[token * d..(token + 1) * d].to_vec();
        for (layer, b) in self.blocks.iter().enumerate() {
            let xn = rmsnorm(&x, &b.input_norm);
            let mut q: Vec<f32> = matvec(&b.wq, &xn, d).iter().zip(&b.bq).map(|(a, c)| a + c).collect();
            let mut k: Vec<f32> = matvec(&b.wk, &xn, kv).iter().zip(&b.bk).map(|(a, c)| a + c).collect();
            let v: Vec<f32> = matvec(&b.wv, &xn, kv).iter().zip(&b.bv).map(|(a, c)| a + c).collect();
            rotate(&mut q, hs, cos, sin);
            rotate(&mut k, hs, cos, sin);
            self.keys[layer].push(k);
            self.values[layer].push(v);

            let mut attn = vec![0.0f32; d];
            for head in 0..c.q_head_count {
                let kvh = head / c.mem_num;
                let qh = &q[head * hs..(head + 1) * hs];
                let scores: Vec<f32> = self.keys[layer]
                    .iter()
                    .map(|k| {
                        let kh = &k[kvh * hs..(kvh + 1) * hs];
                        qh.iter().zip(kh).map(|(a, b)| a * b).sum::<f32>() / (hs as f32).sqrt()
                    })
                    .collect();
                let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
                let sum: f32 = exps.iter().sum();
                for (t, e) in exps.iter().enumerate() {
                    let vh = &self.values[layer][t][kvh * hs..(kvh + 1) * hs];
                    for i in 0..hs {
                        attn[head * hs + i] += e / sum * vh[i];
                    }
                }
            }
            let o = matvec(&b.wo, &attn, d);
            for i in 0..d {
                x[i] += o[i];
            }

            let xn = rmsnorm(&x, &b.post_norm);
            let g = matvec(&b.gate, &xn, c.hidden_dim);
            let u = matvec(&b.up, &xn, c.hidden_dim);
            let act: Vec<f32> = g
                .iter()
                .zip(&u)
                .map(|(g, u)| g / (1.0 + (-g).exp()) * u)
                .collect();
            let down = matvec(&b.down, &act, d);
            for i in 0..d {
                x[i] += down[i];
            }
        }

        let xn = rmsnorm(&x, &self.final_norm);
        matvec(&self.classifier, &xn, c.vocab_size)
    }
}
