//! Samplers for the reference backend.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ctxkeeper_core::{Sampler, SamplerStage, SamplingConfig, Token};

use crate::tokenizer::END_OF_SEQUENCE;

/// Candidate token with its current logit.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    token: Token,
    logit: f32,
}

/// Applies a configured sequence of sampler stages.
///
/// Filtering stages narrow the candidate list; the chain ends with either a
/// seeded draw from the softmax distribution or an argmax pick. A chain
/// without a selecting stage falls back to argmax.
#[derive(Debug)]
pub struct ChainSampler {
    stages: Vec<SamplerStage>,
    history: VecDeque<Token>,
    history_limit: usize,
    seed: u64,
    rng: StdRng,
}

impl ChainSampler {
    pub fn new(stages: Vec<SamplerStage>) -> Self {
        let history_limit = stages
            .iter()
            .find_map(|stage| match stage {
                SamplerStage::Penalties { last_n, .. } => Some(*last_n),
                _ => None,
            })
            .unwrap_or(0);
        let seed = stages
            .iter()
            .find_map(|stage| match stage {
                SamplerStage::Distribution { seed } => Some(u64::from(*seed)),
                _ => None,
            })
            .unwrap_or(0);

        Self {
            stages,
            history: VecDeque::new(),
            history_limit,
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Build the chain described by `config` for a window of `window` tokens.
    pub fn from_config(config: &SamplingConfig, window: usize) -> Self {
        Self::new(config.stages(window))
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    fn apply_penalty(&self, candidates: &mut [Candidate], repeat: f32) {
        if repeat == 1.0 {
            return;
        }
        for candidate in candidates.iter_mut() {
            if self.history.contains(&candidate.token) {
                if candidate.logit > 0.0 {
                    candidate.logit /= repeat;
                } else {
                    candidate.logit *= repeat;
                }
            }
        }
    }

    fn draw(&mut self, candidates: &[Candidate]) -> Token {
        let probabilities = softmax(candidates);
        let target = self.rng.random::<f32>();
        let mut cumulative = 0.0;
        for (candidate, probability) in candidates.iter().zip(&probabilities) {
            cumulative += probability;
            if target < cumulative {
                return candidate.token;
            }
        }
        candidates.last().map_or(END_OF_SEQUENCE, |c| c.token)
    }
}

fn sort_descending(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));
}

fn softmax(candidates: &[Candidate]) -> Vec<f32> {
    let max = candidates
        .iter()
        .map(|c| c.logit)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = candidates.iter().map(|c| (c.logit - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

fn argmax(candidates: &[Candidate]) -> Token {
    candidates
        .iter()
        .max_by(|a, b| a.logit.total_cmp(&b.logit))
        .map_or(END_OF_SEQUENCE, |c| c.token)
}

impl Sampler for ChainSampler {
    fn sample(&mut self, logits: &[f32]) -> Token {
        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .map(|(token, &logit)| Candidate {
                token: token as Token,
                logit,
            })
            .collect();
        if candidates.is_empty() {
            return END_OF_SEQUENCE;
        }

        let stages = self.stages.clone();
        for stage in stages {
            match stage {
                SamplerStage::Penalties { repeat, .. } => self.apply_penalty(&mut candidates, repeat),
                SamplerStage::TopK(k) => {
                    sort_descending(&mut candidates);
                    candidates.truncate((k as usize).max(1));
                }
                SamplerStage::TopP(p) => {
                    sort_descending(&mut candidates);
                    let probabilities = softmax(&candidates);
                    let mut cumulative = 0.0;
                    let mut keep = candidates.len();
                    for (i, probability) in probabilities.iter().enumerate() {
                        cumulative += probability;
                        if cumulative >= p {
                            keep = i + 1;
                            break;
                        }
                    }
                    candidates.truncate(keep);
                }
                SamplerStage::Temperature(t) => {
                    for candidate in &mut candidates {
                        candidate.logit /= t;
                    }
                }
                SamplerStage::Distribution { .. } => return self.draw(&candidates),
                SamplerStage::Greedy => return argmax(&candidates),
            }
        }
        argmax(&candidates)
    }

    fn accept(&mut self, token: Token) {
        if self.history_limit == 0 {
            return;
        }
        self.history.push_back(token);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    fn reset(&mut self) {
        self.history.clear();
        self.rng = StdRng::seed_from_u64(self.seed);
    }
}

/// Plays back a fixed token script, then end-of-sequence forever.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSampler {
    script: VecDeque<Token>,
    accepted: Vec<Token>,
}

impl ScriptedSampler {
    pub fn new(script: impl IntoIterator<Item = Token>) -> Self {
        Self {
            script: script.into_iter().collect(),
            accepted: Vec::new(),
        }
    }

    /// Script the UTF-8 bytes of `text`.
    pub fn from_text(text: &str) -> Self {
        Self::new(text.bytes().map(Token::from))
    }

    pub fn accepted(&self) -> &[Token] {
        &self.accepted
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Sampler for ScriptedSampler {
    fn sample(&mut self, _logits: &[f32]) -> Token {
        self.script.pop_front().unwrap_or(END_OF_SEQUENCE)
    }

    fn accept(&mut self, token: Token) {
        self.accepted.push(token);
    }

    fn reset(&mut self) {
        self.accepted.clear();
    }
}
