use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};
use candle_transformers::generation::LogitsProcessor;

use super::based::Seq2SeqModel;
use super::beam_search::Hypothesis;
use super::translator::{format_hypotheses, DecodeOutput, Selection};
use super::SamplingConfig;
use crate::data::vocabulary::Vocabulary;
use crate::models::unmt::modeling::log_probs;

/// Ancestral sampling, one token per row per step. Row `i` draws from its own
/// generator seeded with `seed + i`, so results do not depend on batch order
/// changes elsewhere. `temperature = None` decodes greedily.
///
/// Output follows the beam-search layout: `max_length + 1` columns, PAD after
/// EOS, and a synthetic EOS for rows that hit the limit.
pub fn sample_decode<M: Seq2SeqModel + ?Sized>(
    model: &M,
    latent: &Tensor,
    src_mask: &Tensor,
    tgt_lang: usize,
    vocab: &Vocabulary,
    config: &SamplingConfig,
) -> Result<DecodeOutput> {
    config.validate()?;
    let b_sz = latent.dim(0)?;
    let bos = vocab.bos(tgt_lang)?;
    let mut processors = (0..b_sz)
        .map(|i| LogitsProcessor::new(config.seed.wrapping_add(i as u64), config.temperature, config.top_p))
        .collect::<Vec<_>>();
    let mut rows = (0..b_sz)
        .map(|i| Hypothesis {
            id: i as u64,
            tokens: vec![bos],
            score: 0.0,
            finished: false,
        })
        .collect::<Vec<_>>();

    if b_sz > 0 {
        let mut history = Tensor::from_vec(vec![bos; b_sz], (b_sz, 1), model.device())?;
        for _ in 0..config.max_length - 1 {
            let logits = model
                .decode_step(&history, latent, src_mask, None, tgt_lang)?
                .to_dtype(DType::F32)?;
            // PAD is never sampled.
            let logits = logits.slice_assign(
                &[0..b_sz, vocab.pad_id as usize..vocab.pad_id as usize + 1],
                &Tensor::full(f32::NEG_INFINITY, (b_sz, 1), logits.device())?,
            )?;
            let scores = log_probs(&logits)?.to_vec2::<f32>()?;

            let mut next = Vec::with_capacity(b_sz);
            for (i, (row, processor)) in rows.iter_mut().zip(processors.iter_mut()).enumerate() {
                if row.finished {
                    next.push(vocab.pad_id);
                    continue;
                }
                let token = processor.sample(&logits.i(i)?)?;
                row.tokens.push(token);
                row.score += scores[i][token as usize];
                row.finished = token == vocab.eos_id;
                next.push(token);
            }
            if rows.iter().all(|r| r.finished) {
                break;
            }
            let column = Tensor::new(next.as_slice(), model.device())?.unsqueeze(1)?;
            history = Tensor::cat(&[&history, &column], 1)?;
        }
    }

    let hypotheses = rows
        .into_iter()
        .map(|mut row| {
            if !row.finished {
                row.tokens.push(vocab.eos_id);
            }
            vec![row]
        })
        .collect::<Vec<_>>();
    let (tokens, lengths) = format_hypotheses(
        &hypotheses,
        Selection::Best,
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
