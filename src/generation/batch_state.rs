use candle_core::{DType, Result, Tensor};

/// Per-row decoder inputs of a beam search: the token history and the
/// encoder-side tensors it attends to. Rows follow the live hypotheses.
#[derive(Debug, Clone)]
pub struct BatchState {
    history: Tensor,
    memory: Tensor,
    src_mask: Tensor,
}

impl BatchState {
    /// Gathers `origin[i]` of the per-example `memory` and `src_mask` into row
    /// `i`, and starts every row with `bos`.
    pub fn new(memory: &Tensor, src_mask: &Tensor, origin: &[u32], bos: u32) -> Result<Self> {
        let index = Tensor::new(origin, memory.device())?;
        let history = Tensor::from_vec(vec![bos; origin.len()], (origin.len(), 1), memory.device())?;
        Ok(Self {
            history,
            memory: memory.index_select(&index, 0)?,
            src_mask: src_mask.index_select(&index, 0)?,
        })
    }

    pub fn rows(&self) -> usize {
        self.history.dims()[0]
    }

    pub fn steps(&self) -> usize {
        self.history.dims()[1]
    }

    /// Token history, `[rows, steps]` of `U32`.
    pub fn history(&self) -> &Tensor {
        &self.history
    }

    pub fn memory(&self) -> &Tensor {
        &self.memory
    }

    pub fn src_mask(&self) -> &Tensor {
        &self.src_mask
    }

    /// New row `i` becomes old row `origin[i]`. Rows may be duplicated or dropped.
    pub fn reorder(&mut self, origin: &[u32]) -> Result<()> {
        let index = Tensor::new(origin, self.history.device())?;
        self.history = self.history.index_select(&index, 0)?;
        self.memory = self.memory.index_select(&index, 0)?;
        self.src_mask = self.src_mask.index_select(&index, 0)?;
        Ok(())
    }

    pub fn append(&mut self, tokens: &[u32]) -> Result<()> {
        if tokens.len() != self.rows() {
            candle_core::bail!("{} tokens for {} rows", tokens.len(), self.rows())
        }
        let column = Tensor::new(tokens, self.history.device())?
            .to_dtype(DType::U32)?
            .unsqueeze(1)?;
        self.history = Tensor::cat(&[&self.history, &column], 1)?;
        Ok(())
    }
}
