//! Drives the model through encode, latent sampling and step-wise beam search.

use anyhow::Result;
use candle_core::{Device, Tensor};

use super::based::Seq2SeqModel;
use super::batch_state::BatchState;
use super::beam_search::{BeamSearch, Hypothesis};
use super::BeamSearchConfig;
use crate::data::vocabulary::Vocabulary;
use crate::models::unmt::modeling::log_probs;

/// Which ranked hypothesis of each example ends up in the token tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    Best,
    /// Zero-based rank; examples with fewer hypotheses report their last one.
    Rank(usize),
}

impl Selection {
    pub fn pick<'a>(&self, hypotheses: &'a [Hypothesis]) -> Option<&'a Hypothesis> {
        match *self {
            Selection::Best => hypotheses.first(),
            Selection::Rank(r) => hypotheses.get(r).or_else(|| hypotheses.last()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodeOutput {
    /// `[B, width]` `U32`: BOS, tokens, one EOS, then PAD.
    pub tokens: Tensor,
    /// `[B]` `U32`, counting BOS through EOS.
    pub lengths: Tensor,
    /// Every reported hypothesis per example, best first.
    pub hypotheses: Vec<Vec<Hypothesis>>,
}

impl DecodeOutput {
    pub fn batch_size(&self) -> usize {
        self.hypotheses.len()
    }

    /// Re-formats the tensors around another ranked hypothesis.
    pub fn select(&self, selection: Selection, pad: u32) -> Result<(Tensor, Tensor)> {
        format_hypotheses(&self.hypotheses, selection, pad, self.tokens.dim(1)?, self.tokens.device())
    }

    /// Rows of `tokens` cut at their length.
    pub fn sequences(&self) -> Result<Vec<Vec<u32>>> {
        let lengths = self.lengths.to_vec1::<u32>()?;
        if lengths.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.tokens.to_vec2::<u32>()?;
        Ok(rows
            .into_iter()
            .zip(lengths)
            .map(|(mut row, len)| {
                row.truncate(len as usize);
                row
            })
            .collect())
    }
}

/// Packs one hypothesis per example into a PAD-filled `[B, width]` tensor,
/// `width` being the longest chosen hypothesis or `min_width`, whichever is larger.
pub fn format_hypotheses(
    hypotheses: &[Vec<Hypothesis>],
    selection: Selection,
    pad: u32,
    min_width: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let chosen = hypotheses
        .iter()
        .enumerate()
        .map(|(b, hyps)| {
            selection
                .pick(hyps)
                .ok_or_else(|| anyhow::anyhow!("example {b} has no hypothesis"))
        })
        .collect::<Result<Vec<_>>>()?;
    let b_sz = chosen.len();
    let width = chosen.iter().map(|h| h.tokens.len()).max().unwrap_or(0).max(min_width);

    let mut flat = vec![pad; b_sz * width];
    let mut lengths = Vec::with_capacity(b_sz);
    for (row, hyp) in chosen.iter().enumerate() {
        flat[row * width..row * width + hyp.tokens.len()].copy_from_slice(&hyp.tokens);
        lengths.push(hyp.tokens.len() as u32);
    }
    let tokens = Tensor::from_vec(flat, (b_sz, width), device)?;
    let lengths = Tensor::from_vec(lengths, b_sz, device)?;
    Ok((tokens, lengths))
}

/// Beam search over an already computed latent, `[B, S, d_model]`, with its
/// source mask `[B, 1, 1, S]`.
///
/// Each step feeds every live row to the decoder, hands the log-probabilities
/// to [`BeamSearch`], then reorders the decoder history, memory and mask by
/// the returned origins before appending the chosen tokens. The model gets
/// `max_length - 1` steps; the last position is kept for the closing EOS, so
/// the token tensor is always `max_length + 1` wide. Each row holds the
/// `n_best`-th ranked hypothesis of its example, or the last one when fewer
/// were found.
pub fn beam_search<M: Seq2SeqModel + ?Sized>(
    model: &M,
    latent: &Tensor,
    src_mask: &Tensor,
    tgt_lang: usize,
    vocab: &Vocabulary,
    config: &BeamSearchConfig,
) -> Result<DecodeOutput> {
    config.validate()?;
    let b_sz = latent.dim(0)?;
    if src_mask.dim(0)? != b_sz {
        anyhow::bail!("latent has {b_sz} rows, source mask has {}", src_mask.dim(0)?);
    }
    let bos = vocab.bos(tgt_lang)?;
    let vocab_size = model.vocab_size(tgt_lang)?;
    let mut search =
        BeamSearch::new(b_sz, vocab_size, bos, vocab.eos_id, config)?.with_blocked_tokens(&[vocab.pad_id]);

    if b_sz > 0 {
        let mut state = BatchState::new(latent, src_mask, &search.row_examples(), bos)?;
        for step in 0..config.max_length - 1 {
            let logits = model.decode_step(state.history(), state.memory(), state.src_mask(), None, tgt_lang)?;
            let outcome = search.advance(&log_probs(&logits)?)?;
            if search.is_done() {
                tracing::debug!("all beams finished after {} steps", step + 1);
                break;
            }
            state.reorder(&outcome.origin)?;
            state.append(&outcome.tokens)?;
        }
    }

    let hypotheses = search.finalize();
    let (tokens, lengths) = format_hypotheses(
        &hypotheses,
        Selection::Rank(config.n_best - 1),
        vocab.pad_id,
        config.max_length + 1,
        model.device(),
    )?;
    Ok(DecodeOutput {
        tokens,
        lengths,
        hypotheses,
    })
}

/// Encodes `src_tokens`, optionally draws `n_samples` latent samples per
/// sentence, and beam-searches into `tgt_lang`.
///
/// With `n_samples > 0` a variational model yields `n_samples * B` rows,
/// sample-major; a pass-through bottleneck keeps the `B` rows.
#[allow(clippy::too_many_arguments)]
pub fn translate<M: Seq2SeqModel + ?Sized>(
    model: &M,
    src_tokens: &Tensor,
    src_mask: &Tensor,
    src_lang: usize,
    tgt_lang: usize,
    vocab: &Vocabulary,
    config: &BeamSearchConfig,
    n_samples: usize,
) -> Result<DecodeOutput> {
    let encoded = model.encode(src_tokens, src_mask, src_lang)?;
    if n_samples == 0 {
        return beam_search(model, &encoded, src_mask, tgt_lang, vocab, config);
    }
    let code = model.sample_latent(&encoded, src_mask, n_samples)?;
    let src_mask = code.expand_rows(src_mask)?;
    beam_search(model, &code.latent, &src_mask, tgt_lang, vocab, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::LengthPenalty;
    use crate::models::unmt::config::ModelConfig;
    use crate::models::unmt::modeling::Seq2SeqTransformer;
    use crate::utils::masks::source_mask;
    use candle_core::{DType, Result as CandleResult};
    use candle_nn::{VarBuilder, VarMap};
    use std::cell::{Cell, RefCell};

    const BOS: u32 = 0;
    const EOS: u32 = 1;
    const PAD: u32 = 2;

    fn vocab(size: usize) -> Vocabulary {
        Vocabulary {
            pad_id: PAD,
            eos_id: EOS,
            blank_id: 3,
            unk_id: None,
            bos_ids: vec![BOS],
            vocab_sizes: vec![size],
        }
    }

    /// Memory rows carry the example index in their only element.
    fn tagged_memory(b_sz: usize) -> CandleResult<(Tensor, Tensor)> {
        let tags = (0..b_sz).map(|b| b as f32).collect::<Vec<_>>();
        let memory = Tensor::from_vec(tags, (b_sz, 1, 1), &Device::Cpu)?;
        let mask = Tensor::ones((b_sz, 1, 1, 1), DType::U8, &Device::Cpu)?;
        Ok((memory, mask))
    }

    /// Scores every row with `score(example, prefix)`.
    struct MockModel<F> {
        device: Device,
        vocab_size: usize,
        score: F,
        calls: Cell<usize>,
    }

    impl<F: Fn(usize, &[u32]) -> Vec<f32>> MockModel<F> {
        fn new(vocab_size: usize, score: F) -> Self {
            Self {
                device: Device::Cpu,
                vocab_size,
                score,
                calls: Cell::new(0),
            }
        }
    }

    impl<F: Fn(usize, &[u32]) -> Vec<f32>> Seq2SeqModel for MockModel<F> {
        fn device(&self) -> &Device {
            &self.device
        }

        fn vocab_size(&self, _lang: usize) -> CandleResult<usize> {
            Ok(self.vocab_size)
        }

        fn encode(&self, tokens: &Tensor, _src_mask: &Tensor, _src_lang: usize) -> CandleResult<Tensor> {
            tokens.to_dtype(DType::F32)?.unsqueeze(2)
        }

        fn decode_step(
            &self,
            prefix: &Tensor,
            latent: &Tensor,
            _src_mask: &Tensor,
            _tgt_mask: Option<&Tensor>,
            _tgt_lang: usize,
        ) -> CandleResult<Tensor> {
            self.calls.set(self.calls.get() + 1);
            let rows = prefix.to_vec2::<u32>()?;
            let tags = latent.flatten_all()?.to_vec1::<f32>()?;
            let logits = rows
                .iter()
                .zip(tags)
                .flat_map(|(row, tag)| (self.score)(tag as usize, row.as_slice()))
                .collect::<Vec<_>>();
            Tensor::from_vec(logits, (rows.len(), self.vocab_size), &self.device)
        }
    }

    /// Puts all mass on `script[prefix_len - 1]`, EOS once the script runs out.
    fn scripted(scripts: Vec<Vec<u32>>, vocab_size: usize) -> impl Fn(usize, &[u32]) -> Vec<f32> {
        move |example, prefix| {
            let target = scripts[example].get(prefix.len() - 1).copied().unwrap_or(EOS);
            (0..vocab_size as u32)
                .map(|t| if t == target { 0.0 } else { f32::NEG_INFINITY })
                .collect()
        }
    }

    /// Deterministic pseudo-random logits.
    fn hashed(vocab_size: usize) -> impl Fn(usize, &[u32]) -> Vec<f32> {
        move |example, prefix| {
            let mut h = 1469598103934665603u64 ^ example as u64;
            for &t in prefix {
                h = (h ^ t as u64).wrapping_mul(1099511628211);
            }
            (0..vocab_size as u64)
                .map(|t| {
                    let x = (h ^ t).wrapping_mul(6364136223846793005) >> 40;
                    (x % 1000) as f32 / 250.0
                })
                .collect()
        }
    }

    fn assert_well_formed(out: &DecodeOutput) -> anyhow::Result<()> {
        let rows = out.tokens.to_vec2::<u32>()?;
        let lengths = out.lengths.to_vec1::<u32>()?;
        for (row, len) in rows.iter().zip(lengths) {
            let len = len as usize;
            assert_eq!(row[0], BOS);
            assert_eq!(row[len - 1], EOS);
            assert!(row[1..len - 1].iter().all(|&t| t != EOS && t != PAD));
            assert!(row[len..].iter().all(|&t| t == PAD));
        }
        Ok(())
    }

    #[test]
    fn scripted_batch_of_two() -> anyhow::Result<()> {
        let model = MockModel::new(5, scripted(vec![vec![2, 3], vec![4]], 5));
        let (memory, mask) = tagged_memory(2)?;
        let config = BeamSearchConfig {
            beam_size: 3,
            n_best: 1,
            max_length: 4,
            length_penalty: LengthPenalty::None,
            block_repeated_ngram: 0,
        };
        // PAD sits outside the five scored ids so it can't collide with the script.
        let pad = 5;
        let vocab = Vocabulary {
            pad_id: pad,
            ..vocab(5)
        };
        let out = beam_search(&model, &memory, &mask, 0, &vocab, &config)?;
        assert_eq!(
            out.tokens.to_vec2::<u32>()?,
            vec![vec![BOS, 2, 3, EOS, pad], vec![BOS, 4, EOS, pad, pad]]
        );
        assert_eq!(out.lengths.to_vec1::<u32>()?, vec![4, 3]);
        // Stops once both examples are done.
        assert_eq!(model.calls.get(), 3);
        Ok(())
    }

    #[test]
    fn reports_the_n_best_th_hypothesis() -> anyhow::Result<()> {
        // EOS is best right after BOS, then a detour through token 3.
        let score = |_example: usize, prefix: &[u32]| match prefix {
            [_] => vec![-5.0, -0.2, f32::NEG_INFINITY, -1.0, f32::NEG_INFINITY],
            _ => vec![-5.0, -0.1, f32::NEG_INFINITY, -3.0, -4.0],
        };
        let model = MockModel::new(5, score);
        let (memory, mask) = tagged_memory(1)?;
        let config = BeamSearchConfig {
            beam_size: 2,
            n_best: 2,
            max_length: 4,
            length_penalty: LengthPenalty::None,
            block_repeated_ngram: 0,
        };
        let out = beam_search(&model, &memory, &mask, 0, &vocab(5), &config)?;
        let ranked = out.hypotheses[0].iter().map(|h| h.tokens.clone()).collect::<Vec<_>>();
        assert_eq!(ranked, vec![vec![BOS, EOS], vec![BOS, 3, EOS]]);
        assert_eq!(out.sequences()?, vec![vec![BOS, 3, EOS]]);

        let (best, lengths) = out.select(Selection::Best, PAD)?;
        assert_eq!(best.to_vec2::<u32>()?, vec![vec![BOS, EOS, PAD, PAD, PAD]]);
        assert_eq!(lengths.to_vec1::<u32>()?, vec![2]);
        Ok(())
    }

    #[test]
    fn greedy_matches_argmax_decoding() -> anyhow::Result<()> {
        let vocab_size = 7;
        let score = hashed(vocab_size);
        let (memory, mask) = tagged_memory(3)?;
        let max_length = 6;

        let mut expected = Vec::new();
        for example in 0..3 {
            let mut prefix = vec![BOS];
            for _ in 0..max_length - 1 {
                let logits = score(example, prefix.as_slice());
                let mut best = 0;
                for (t, &l) in logits.iter().enumerate() {
                    if t as u32 != PAD && (best as u32 == PAD || l > logits[best]) {
                        best = t;
                    }
                }
                prefix.push(best as u32);
                if best as u32 == EOS {
                    break;
                }
            }
            if prefix.last() != Some(&EOS) {
                prefix.push(EOS);
            }
            expected.push(prefix);
        }

        let model = MockModel::new(vocab_size, hashed(vocab_size));
        let out = beam_search(&model, &memory, &mask, 0, &vocab(vocab_size), &BeamSearchConfig::greedy(max_length))?;
        assert_eq!(out.sequences()?, expected);
        Ok(())
    }

    #[test]
    fn beam_output_is_well_formed() -> anyhow::Result<()> {
        let model = MockModel::new(9, hashed(9));
        let (memory, mask) = tagged_memory(4)?;
        let config = BeamSearchConfig {
            beam_size: 4,
            n_best: 2,
            max_length: 8,
            length_penalty: LengthPenalty::Wu { alpha: 0.6 },
            block_repeated_ngram: 3,
        };
        let out = beam_search(&model, &memory, &mask, 0, &vocab(9), &config)?;
        assert_eq!(out.batch_size(), 4);
        assert_well_formed(&out)?;
        let (second, _) = out.select(Selection::Rank(1), PAD)?;
        assert_eq!(second.dim(0)?, 4);
        Ok(())
    }

    #[test]
    fn reorder_keeps_history_and_memory_aligned() -> anyhow::Result<()> {
        // Example e may only emit tokens from its own set, so any row whose
        // memory tag disagrees with its history betrays a bad reorder.
        let allowed = [[3u32, 4], [5, 6]];
        let mismatch = RefCell::new(false);
        let score = |example: usize, prefix: &[u32]| {
            if prefix[1..].iter().any(|t| !allowed[example].contains(t)) {
                *mismatch.borrow_mut() = true;
            }
            let parity = prefix.iter().sum::<u32>() % 2;
            (0..7u32)
                .map(|t| {
                    if t == allowed[example][parity as usize] {
                        -0.4
                    } else if t == allowed[example][1 - parity as usize] {
                        -0.6
                    } else if t == EOS {
                        -3.0 + 0.4 * prefix.len() as f32
                    } else {
                        f32::NEG_INFINITY
                    }
                })
                .collect::<Vec<_>>()
        };
        let model = MockModel::new(7, score);
        let (memory, mask) = tagged_memory(2)?;
        let config = BeamSearchConfig {
            beam_size: 3,
            n_best: 2,
            max_length: 7,
            length_penalty: LengthPenalty::None,
            block_repeated_ngram: 0,
        };
        let out = beam_search(&model, &memory, &mask, 0, &vocab(7), &config)?;
        assert!(!*mismatch.borrow());
        assert_well_formed(&out)?;
        for (example, hyps) in out.hypotheses.iter().enumerate() {
            for hyp in hyps {
                let body = &hyp.tokens[1..hyp.tokens.len() - 1];
                assert!(body.iter().all(|t| allowed[example].contains(t)));
            }
        }
        Ok(())
    }

    #[test]
    fn unfinished_examples_get_a_synthetic_eos() -> anyhow::Result<()> {
        // EOS is never produced.
        let model = MockModel::new(5, scripted(vec![vec![4; 10]], 5));
        let (memory, mask) = tagged_memory(1)?;
        let config = BeamSearchConfig {
            beam_size: 2,
            n_best: 1,
            max_length: 4,
            length_penalty: LengthPenalty::None,
            block_repeated_ngram: 0,
        };
        let out = beam_search(&model, &memory, &mask, 0, &vocab(5), &config)?;
        assert_eq!(out.sequences()?, vec![vec![BOS, 4, 4, 4, EOS]]);
        assert!(!out.hypotheses[0][0].finished);
        Ok(())
    }

    #[test]
    fn empty_batch_yields_empty_output() -> anyhow::Result<()> {
        let model = MockModel::new(5, hashed(5));
        let memory = Tensor::zeros((0, 1, 1), DType::F32, &Device::Cpu)?;
        let mask = Tensor::zeros((0, 1, 1, 1), DType::U8, &Device::Cpu)?;
        let out = beam_search(&model, &memory, &mask, 0, &vocab(5), &BeamSearchConfig::default())?;
        assert_eq!(out.batch_size(), 0);
        assert_eq!(out.tokens.dims(), &[0, 101]);
        assert_eq!(model.calls.get(), 0);
        Ok(())
    }

    #[test]
    fn rejects_unknown_target_language() -> anyhow::Result<()> {
        let model = MockModel::new(5, hashed(5));
        let (memory, mask) = tagged_memory(1)?;
        assert!(beam_search(&model, &memory, &mask, 3, &vocab(5), &BeamSearchConfig::default()).is_err());
        Ok(())
    }

    #[test]
    fn selection_clamps_to_the_last_hypothesis() {
        let hyp = |score| Hypothesis {
            id: 0,
            tokens: vec![BOS, EOS],
            score,
            finished: true,
        };
        let hyps = vec![hyp(-1.0), hyp(-2.0)];
        assert_eq!(Selection::Best.pick(&hyps).map(|h| h.score), Some(-1.0));
        assert_eq!(Selection::Rank(5).pick(&hyps).map(|h| h.score), Some(-2.0));
        assert!(Selection::Best.pick(&[]).is_none());
    }

    #[test]
    fn translates_with_a_random_transformer() -> anyhow::Result<()> {
        let mut config = ModelConfig::tiny(8, 2);
        config.variational = true;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Seq2SeqTransformer::new(&config, vb)?;
        let vocab = Vocabulary {
            pad_id: PAD,
            eos_id: EOS,
            blank_id: 3,
            unk_id: None,
            bos_ids: vec![0, 4],
            vocab_sizes: vec![8, 8],
        };

        let src = Tensor::new(&[[0u32, 5, 6, EOS], [0, 7, EOS, PAD]], &Device::Cpu)?;
        let mask = source_mask(&src, PAD)?;
        let beam = BeamSearchConfig {
            beam_size: 3,
            n_best: 1,
            max_length: 5,
            length_penalty: LengthPenalty::Wu { alpha: 1.0 },
            block_repeated_ngram: 0,
        };

        let out = translate(&model, &src, &mask, 0, 1, &vocab, &beam, 0)?;
        assert_eq!(out.batch_size(), 2);
        for row in out.sequences()? {
            assert_eq!(row[0], 4);
            assert_eq!(row.last(), Some(&EOS));
            assert!(row.len() <= beam.max_length + 1);
        }

        let sampled = translate(&model, &src, &mask, 0, 1, &vocab, &beam, 3)?;
        assert_eq!(sampled.batch_size(), 6);
        Ok(())
    }
}
