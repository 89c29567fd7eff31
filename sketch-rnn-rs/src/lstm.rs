//! LSTM cell, unidirectional layer and bidirectional wrapper.
//!
//! Everything is time-major: sequences are `[seq_len, batch, features]` and
//! states are `[batch, hidden]`. The layers unroll the cell step by step so the
//! decoder can drive the same code path one step at a time while sampling.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Recurrent state carried between steps.
///
/// For a [`BidirLstm`] the final state has a leading direction axis:
/// `h` and `c` are `[2, batch, hidden]` with the forward direction at index 0.
#[derive(Debug, Clone)]
pub struct LstmState {
    /// Hidden state
    pub h: Tensor,
    /// Cell (memory) state
    pub c: Tensor,
}

impl LstmState {
    /// Create a state from hidden and memory tensors
    pub fn new(h: Tensor, c: Tensor) -> Self {
        Self { h, c }
    }

    /// All-zero state of shape `[batch, hidden]`
    pub fn zeros(batch: usize, hidden: usize, device: &Device) -> Result<Self> {
        let h = Tensor::zeros((batch, hidden), DType::F32, device)?;
        Ok(Self { c: h.clone(), h })
    }
}

/// A single LSTM step.
///
/// Gate pre-activations are `ih(x) + hh(h)`, split into the input, forget,
/// cell-candidate and output gates in that order:
/// - i, f, o = σ(·), g = tanh(·)
/// - c' = f ⊙ c + i ⊙ g
/// - h' = o ⊙ tanh(c')
#[derive(Debug, Clone)]
pub struct LstmCell {
    ih: Linear,
    hh: Linear,
    hidden_size: usize,
}

impl LstmCell {
    /// Create a cell mapping `input_size` features to `hidden_size` units.
    pub fn new(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let ih = linear(input_size, 4 * hidden_size, vb.pp("ih"))?;
        let hh = linear(hidden_size, 4 * hidden_size, vb.pp("hh"))?;
        Ok(Self {
            ih,
            hh,
            hidden_size,
        })
    }

    /// Hidden width of the cell
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// One transition: `x` is `[batch, input]`, returns `(h', (h', c'))`.
    pub fn forward(&self, x: &Tensor, state: &LstmState) -> Result<(Tensor, LstmState)> {
        let gates = (self.ih.forward(x)? + self.hh.forward(&state.h)?)?;
        let gates = gates.chunk(4, D::Minus1)?;

        let in_gate = candle_nn::ops::sigmoid(&gates[0])?;
        let forget_gate = candle_nn::ops::sigmoid(&gates[1])?;
        let cell_gate = gates[2].tanh()?;
        let out_gate = candle_nn::ops::sigmoid(&gates[3])?;

        let c = ((forget_gate * &state.c)? + (in_gate * cell_gate)?)?;
        let h = (out_gate * c.tanh()?)?;

        Ok((h.clone(), LstmState::new(h, c)))
    }
}

/// Traversal order of an [`LstmLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Steps `0..T`
    Forward,
    /// Steps `T-1..=0`; outputs are returned in natural time order
    Reverse,
}

/// One cell unrolled over the time axis.
#[derive(Debug, Clone)]
pub struct LstmLayer {
    cell: LstmCell,
    direction: Direction,
}

impl LstmLayer {
    /// Create a layer with a fresh cell under `vb`.
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        direction: Direction,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            cell: LstmCell::new(input_size, hidden_size, vb)?,
            direction,
        })
    }

    /// Traversal direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Hidden width
    pub fn hidden_size(&self) -> usize {
        self.cell.hidden_size()
    }

    /// Run over `input` (`[T, B, I]`) from `state`.
    ///
    /// Returns per-step outputs `[T, B, H]` indexed by input position and the
    /// state after the last processed step.
    pub fn forward(&self, input: &Tensor, state: LstmState) -> Result<(Tensor, LstmState)> {
        let seq_len = input.dim(0)?;
        let steps: Vec<usize> = match self.direction {
            Direction::Forward => (0..seq_len).collect(),
            Direction::Reverse => (0..seq_len).rev().collect(),
        };

        let mut state = state;
        let mut outputs = Vec::with_capacity(seq_len);
        for t in steps {
            let (out, next) = self.cell.forward(&input.get(t)?, &state)?;
            outputs.push(out);
            state = next;
        }
        if self.direction == Direction::Reverse {
            outputs.reverse();
        }

        Ok((Tensor::stack(&outputs, 0)?, state))
    }
}

/// Forward and reverse layers over the same input.
#[derive(Debug, Clone)]
pub struct BidirLstm {
    forward: LstmLayer,
    reverse: LstmLayer,
}

impl BidirLstm {
    /// Two independent layers under `vb.pp("fwd")` and `vb.pp("rev")`.
    pub fn new(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            forward: LstmLayer::new(input_size, hidden_size, Direction::Forward, vb.pp("fwd"))?,
            reverse: LstmLayer::new(input_size, hidden_size, Direction::Reverse, vb.pp("rev"))?,
        })
    }

    /// Hidden width of each direction
    pub fn hidden_size(&self) -> usize {
        self.forward.hidden_size()
    }

    /// Run both directions from their own initial states.
    ///
    /// Outputs are `[T, B, 2H]` (forward features first); the final state is
    /// stacked to `[2, B, H]`.
    pub fn forward(
        &self,
        input: &Tensor,
        fwd_state: LstmState,
        rev_state: LstmState,
    ) -> Result<(Tensor, LstmState)> {
        let (fwd_out, fwd_state) = self.forward.forward(input, fwd_state)?;
        let (rev_out, rev_state) = self.reverse.forward(input, rev_state)?;

        let outputs = Tensor::cat(&[fwd_out, rev_out], D::Minus1)?;
        let h = Tensor::stack(&[fwd_state.h, rev_state.h], 0)?;
        let c = Tensor::stack(&[fwd_state.c, rev_state.c], 0)?;

        Ok((outputs, LstmState::new(h, c)))
    }
}
