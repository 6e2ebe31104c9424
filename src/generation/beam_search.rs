//! Batched beam search bookkeeping.
//!
//! [`BeamSearch`] never touches the model. Each step it receives one row of
//! log-probabilities per live hypothesis, in row order: beam 0's live
//! hypotheses first, then beam 1's, and so on. It answers with the rows to
//! keep (`origin`) and the token to append to each kept row. The caller
//! reorders its decoder state accordingly.

use anyhow::Result;
use candle_core::{DType, Tensor};
use std::cmp::Ordering;

use super::{BeamSearchConfig, LengthPenalty};

#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Unique within one search.
    pub id: u64,
    /// Starts with BOS. Ends with EOS once the hypothesis is complete.
    pub tokens: Vec<u32>,
    /// Cumulative log-probability.
    pub score: f32,
    /// False for hypotheses closed by the step limit rather than by EOS.
    pub finished: bool,
}

impl Hypothesis {
    /// Tokens produced after BOS.
    pub fn generated_len(&self) -> usize {
        self.tokens.len().saturating_sub(1)
    }

    pub fn normalized_score(&self, penalty: &LengthPenalty) -> f32 {
        penalty.normalize(self.score, self.generated_len())
    }

    fn would_repeat_ngram(&self, token: u32, n: usize) -> bool {
        if n == 0 || self.tokens.len() < n {
            return false;
        }
        let tail = &self.tokens[self.tokens.len() - (n - 1)..];
        self.tokens
            .windows(n)
            .any(|w| w[n - 1] == token && &w[..n - 1] == tail)
    }
}

#[derive(Debug, Clone)]
struct Beam {
    live: Vec<Hypothesis>,
    finished: Vec<Hypothesis>,
    done: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    slot: usize,
    token: u32,
    log_prob: f32,
    rank: f32,
}

impl Candidate {
    /// Best first: higher rank, then lower token id, then lower slot.
    fn order(a: &Self, b: &Self) -> Ordering {
        b.rank
            .partial_cmp(&a.rank)
            .unwrap_or(Ordering::Equal)
            .then(a.token.cmp(&b.token))
            .then(a.slot.cmp(&b.slot))
    }
}

/// What the caller must do to its per-row state after a step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// New row `i` continues old row `origin[i]`.
    pub origin: Vec<u32>,
    /// Token appended to new row `i`.
    pub tokens: Vec<u32>,
    /// Beams that closed a hypothesis with EOS this step.
    pub finished_beams: Vec<usize>,
}

impl StepOutcome {
    pub fn any_finished(&self) -> bool {
        !self.finished_beams.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BeamSearch {
    beams: Vec<Beam>,
    config: BeamSearchConfig,
    vocab_size: usize,
    bos: u32,
    eos: u32,
    blocked: Vec<u32>,
    step: usize,
    next_id: u64,
}

impl BeamSearch {
    /// Every beam starts with `beam_size` copies of `[bos]` at score 0. Copies
    /// are expanded once, so the first step draws from a single distribution.
    pub fn new(batch_size: usize, vocab_size: usize, bos: u32, eos: u32, config: &BeamSearchConfig) -> Result<Self> {
        config.validate()?;
        if vocab_size == 0 {
            anyhow::bail!("empty target vocabulary");
        }
        if bos as usize >= vocab_size || eos as usize >= vocab_size {
            anyhow::bail!("bos {bos} / eos {eos} outside a vocabulary of {vocab_size}");
        }
        let mut next_id = 0;
        let beams = (0..batch_size)
            .map(|_| Beam {
                live: (0..config.beam_size)
                    .map(|_| {
                        next_id += 1;
                        Hypothesis {
                            id: next_id - 1,
                            tokens: vec![bos],
                            score: 0.0,
                            finished: false,
                        }
                    })
                    .collect(),
                finished: Vec::new(),
                done: false,
            })
            .collect();
        Ok(Self {
            beams,
            config: config.clone(),
            vocab_size,
            bos,
            eos,
            blocked: Vec::new(),
            step: 0,
            next_id,
        })
    }

    /// Tokens that are never appended, e.g. PAD.
    pub fn with_blocked_tokens(mut self, tokens: &[u32]) -> Self {
        self.blocked.extend(tokens.iter().filter(|&&t| t != self.eos));
        self
    }

    pub fn batch_size(&self) -> usize {
        self.beams.len()
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn is_done(&self) -> bool {
        self.beams.iter().all(|b| b.done)
    }

    pub fn live_rows(&self) -> usize {
        self.beams.iter().map(|b| b.live.len()).sum()
    }

    /// Live hypotheses in row order.
    pub fn live_hypotheses(&self) -> impl Iterator<Item = &Hypothesis> {
        self.beams.iter().flat_map(|b| b.live.iter())
    }

    /// Example index of every live row, for tiling per-example tensors.
    pub fn row_examples(&self) -> Vec<u32> {
        self.beams
            .iter()
            .enumerate()
            .flat_map(|(b, beam)| std::iter::repeat(b as u32).take(beam.live.len()))
            .collect()
    }

    /// Advances with a `[live_rows, vocab]` tensor of log-probabilities.
    pub fn advance(&mut self, log_probs: &Tensor) -> Result<StepOutcome> {
        let rows = log_probs.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        self.advance_rows(&rows)
    }

    pub fn advance_rows(&mut self, log_probs: &[Vec<f32>]) -> Result<StepOutcome> {
        if log_probs.len() != self.live_rows() {
            anyhow::bail!("{} score rows for {} live hypotheses", log_probs.len(), self.live_rows());
        }
        if let Some(row) = log_probs.iter().find(|r| r.len() != self.vocab_size) {
            anyhow::bail!("score row of width {}, vocabulary has {}", row.len(), self.vocab_size);
        }

        let beam_size = self.config.beam_size;
        let n_best = self.config.n_best;
        let penalty = self.config.length_penalty;
        let ngram = self.config.block_repeated_ngram;

        let mut outcome = StepOutcome::default();
        let mut row_offset = 0;
        for (b, beam) in self.beams.iter_mut().enumerate() {
            if beam.done {
                continue;
            }
            let n_live = beam.live.len();
            let rows = &log_probs[row_offset..row_offset + n_live];

            let mut candidates = Vec::new();
            for (slot, hyp) in beam.live.iter().enumerate() {
                if beam.live[..slot].iter().any(|h| h.tokens == hyp.tokens) {
                    continue;
                }
                for (token, &lp) in rows[slot].iter().enumerate() {
                    // Rejects NaN as well.
                    if !(lp > f32::NEG_INFINITY) {
                        continue;
                    }
                    let token = token as u32;
                    if self.blocked.contains(&token) || hyp.would_repeat_ngram(token, ngram) {
                        continue;
                    }
                    let score = hyp.score + lp;
                    if score == f32::NEG_INFINITY {
                        continue;
                    }
                    candidates.push(Candidate {
                        slot,
                        token,
                        log_prob: lp,
                        rank: penalty.normalize(score, hyp.generated_len() + 1),
                    });
                }
            }
            if candidates.len() > beam_size {
                candidates.select_nth_unstable_by(beam_size - 1, Candidate::order);
                candidates.truncate(beam_size);
            }
            candidates.sort_by(Candidate::order);

            let mut live = Vec::with_capacity(candidates.len());
            let mut origin = Vec::with_capacity(candidates.len());
            for c in candidates.iter() {
                let parent = &beam.live[c.slot];
                let mut tokens = Vec::with_capacity(parent.tokens.len() + 1);
                tokens.extend_from_slice(&parent.tokens);
                tokens.push(c.token);
                let hyp = Hypothesis {
                    id: self.next_id,
                    tokens,
                    score: parent.score + c.log_prob,
                    finished: c.token == self.eos,
                };
                self.next_id += 1;
                if hyp.finished {
                    beam.finished.push(hyp);
                } else {
                    origin.push((row_offset + c.slot) as u32);
                    live.push(hyp);
                }
            }
            if candidates.iter().any(|c| c.token == self.eos) {
                outcome.finished_beams.push(b);
                beam.finished
                    .sort_by(|x, y| {
                        y.normalized_score(&penalty)
                            .partial_cmp(&x.normalized_score(&penalty))
                            .unwrap_or(Ordering::Equal)
                    });
                beam.finished.truncate(n_best);
            }

            row_offset += n_live;
            if beam.finished.len() >= n_best || live.is_empty() {
                if live.is_empty() && beam.finished.is_empty() {
                    tracing::warn!("beam {b} ran out of hypotheses at step {}", self.step);
                }
                beam.done = true;
                beam.live.clear();
            } else {
                beam.live = live;
                outcome.origin.extend(origin);
                outcome.tokens.extend(beam.live.iter().filter_map(|h| h.tokens.last().copied()));
            }
        }
        self.step += 1;
        tracing::debug!(
            step = self.step,
            live = self.live_rows(),
            finished = outcome.finished_beams.len(),
            "beam search step"
        );
        Ok(outcome)
    }

    /// Reported hypotheses per example, best first, each ending with exactly
    /// one EOS.
    ///
    /// Examples that never finished report their best live hypotheses (up to
    /// `n_best`) closed with an EOS. An example left with nothing at all
    /// reports `[bos, eos]` at score `-inf`.
    pub fn finalize(self) -> Vec<Vec<Hypothesis>> {
        let penalty = self.config.length_penalty;
        let n_best = self.config.n_best;
        let mut next_id = self.next_id;
        self.beams
            .into_iter()
            .enumerate()
            .map(|(b, beam)| {
                if !beam.finished.is_empty() {
                    return beam.finished;
                }
                if beam.live.is_empty() {
                    next_id += 1;
                    return vec![Hypothesis {
                        id: next_id - 1,
                        tokens: vec![self.bos, self.eos],
                        score: f32::NEG_INFINITY,
                        finished: false,
                    }];
                }
                tracing::warn!("example {b} hit the length limit without finishing");
                let mut live = beam.live;
                live.sort_by(|x, y| {
                    y.normalized_score(&penalty)
                        .partial_cmp(&x.normalized_score(&penalty))
                        .unwrap_or(Ordering::Equal)
                });
                live.dedup_by(|x, y| x.tokens == y.tokens);
                live.truncate(n_best);
                for hyp in live.iter_mut() {
                    hyp.tokens.push(self.eos);
                }
                live
            })
            .collect()
    }
}
