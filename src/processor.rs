//! The sequence driver: one cell type unrolled over the timesteps of a
//! sequence, with shared parameters, accumulated gradients and a reusable
//! state arena.

use std::mem;

use log::{debug, trace};
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Bernoulli, Distribution};

use crate::arena::StateArena;
use crate::cells::{Cell, CellConfig, InitHidden, NextErrors, PrevValues};
use crate::error::{Result, RnnError};
use crate::params::ParamBundle;

/// Drives a [`Cell`] implementation across a sequence.
///
/// The processor owns one parameter bundle shared by every timestep, a
/// gradient bundle filled by backward passes, the per-timestep state arena
/// and the seeded RNG behind dropout. Passes run in strict order: forward
/// ascending, backward descending, relevance descending from a chosen
/// output state.
#[derive(Debug)]
pub struct SequenceProcessor<C: Cell> {
    config: CellConfig,
    params: C::Params,
    grads: C::Params,
    arena: StateArena<C>,
    rng: StdRng,
}

impl<C: Cell> SequenceProcessor<C> {
    /// Builds a processor with fresh parameters drawn from `seed`.
    pub fn new(config: CellConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let params = C::init_params(&config, &mut rng)?;
        let grads = params.zeroed();
        Ok(Self {
            config,
            params,
            grads,
            arena: StateArena::new(),
            rng,
        })
    }

    /// Builds a processor around an existing parameter bundle, e.g. one
    /// restored from a serialized model.
    pub fn with_params(config: CellConfig, params: C::Params, seed: u64) -> Result<Self> {
        config.validate()?;
        let grads = params.zeroed();
        Ok(Self {
            config,
            params,
            grads,
            arena: StateArena::new(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    pub fn params(&self) -> &C::Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut C::Params {
        &mut self.params
    }

    pub fn set_params(&mut self, params: C::Params) {
        self.params = params;
    }

    /// Runs the whole sequence forward and returns the per-timestep outputs.
    ///
    /// # Arguments
    /// * `inputs` - One input vector per timestep, in order.
    /// * `init` - Values standing in for the previous state of the first
    ///   timestep; later timesteps never consult it.
    /// * `save_contributions` - Retain the pre-summation products needed by
    ///   [`calculate_relevance`](Self::calculate_relevance).
    /// * `use_dropout` - Apply the seeded input mask (training mode).
    pub fn forward(
        &mut self,
        inputs: &[Array1<f64>],
        init: Option<&InitHidden>,
        save_contributions: bool,
        use_dropout: bool,
    ) -> Result<Vec<Array1<f64>>> {
        if inputs.is_empty() {
            return Err(RnnError::InvalidInput("empty input sequence".to_string()));
        }
        debug!(
            "forward pass over {} timesteps (contributions: {}, dropout: {})",
            inputs.len(),
            save_contributions,
            use_dropout
        );
        let mut outputs = Vec::with_capacity(inputs.len());
        for (t, input) in inputs.iter().enumerate() {
            outputs.push(self.forward_step(input, t == 0, init, save_contributions, use_dropout)?);
        }
        Ok(outputs)
    }

    /// Runs one timestep at the arena cursor. `first_state` restarts the
    /// cursor; the initial hidden state is only consumed by the first
    /// timestep of a sequence.
    pub fn forward_step(
        &mut self,
        input: &Array1<f64>,
        first_state: bool,
        init: Option<&InitHidden>,
        save_contributions: bool,
        use_dropout: bool,
    ) -> Result<Array1<f64>> {
        if input.len() != self.config.input_size {
            return Err(RnnError::ShapeMismatch {
                what: "sequence input",
                got: input.len(),
                expected: self.config.input_size,
            });
        }
        if let Some(init) = init {
            self.check_init(init)?;
        }
        if first_state {
            self.arena.start_sequence();
        }
        trace!("forward step at state {}", self.arena.in_use());
        let mask = if use_dropout {
            self.dropout_mask()?
        } else {
            None
        };
        let index = self.arena.in_use();
        {
            let state = self.arena.acquire_with(index, || C::new(&self.config))?;
            state.reset();
            state.input_mut().assign_values(input.clone())?;
            if let Some(mask) = &mask {
                state.input_mut().apply_mask(mask)?;
            }
        }
        let (prev, state) = self.arena.with_prev(index)?;
        let prev_values = match (prev, init) {
            (Some(prev), _) => Some(PrevValues {
                output: prev.output().values()?,
                cell: match prev.cell_state() {
                    Some(cell) => Some(cell.values()?),
                    None => None,
                },
            }),
            (None, Some(init)) => Some(PrevValues {
                output: &init.output,
                cell: init.cell.as_ref(),
            }),
            (None, None) => None,
        };
        state.forward(&self.params, prev_values, save_contributions)?;
        Ok(state.output().values()?.clone())
    }

    /// Backpropagation through time over the states of the last forward
    /// pass, in strict reverse order. Gradients are averaged over the
    /// sequence length once and accumulated into the processor's bundle.
    ///
    /// # Arguments
    /// * `output_errors` - One error vector per timestep of the last
    ///   forward pass.
    /// * `propagate_to_input` - Also fill each timestep's input errors.
    pub fn backward(
        &mut self,
        output_errors: &[Array1<f64>],
        propagate_to_input: bool,
    ) -> Result<()> {
        self.run_backward(output_errors, propagate_to_input, None)
    }

    /// Like [`backward`](Self::backward), but each timestep keeps only the
    /// `me_prop_k` largest-magnitude output-error components (recurrent
    /// injection included) and treats the rest as zero.
    pub fn backward_truncated(
        &mut self,
        output_errors: &[Array1<f64>],
        propagate_to_input: bool,
        me_prop_k: usize,
    ) -> Result<()> {
        self.run_backward(output_errors, propagate_to_input, Some(me_prop_k))
    }

    fn run_backward(
        &mut self,
        output_errors: &[Array1<f64>],
        propagate_to_input: bool,
        me_prop_k: Option<usize>,
    ) -> Result<()> {
        let steps = self.arena.in_use();
        if steps == 0 {
            return Err(RnnError::StructuralMisuse(
                "backward pass before any forward pass",
            ));
        }
        if output_errors.len() != steps {
            return Err(RnnError::ShapeMismatch {
                what: "error sequence",
                got: output_errors.len(),
                expected: steps,
            });
        }
        debug!("backward pass over {steps} timesteps");
        let mut pass = self.grads.zeroed();
        for (t, errors) in output_errors.iter().enumerate().rev() {
            trace!("backward step at state {t}");
            let (state, next) = self.arena.with_next(t)?;
            state.output_mut().assign_errors(errors.clone())?;
            let next_errors = match next {
                Some(next) => Some(NextErrors {
                    output: next
                        .recurrent_error()
                        .ok_or(RnnError::UninitializedAccess {
                            what: "recurrent errors",
                        })?,
                    cell: next.recurrent_cell_error(),
                }),
                None => None,
            };
            state.backward(
                &self.params,
                &mut pass,
                next_errors,
                propagate_to_input,
                me_prop_k,
            )?;
        }
        pass.scale(1.0 / steps as f64);
        self.grads.accumulate(&pass);
        Ok(())
    }

    /// The gradient bundle accumulated by backward passes so far.
    pub fn params_errors(&self) -> &C::Params {
        &self.grads
    }

    /// Takes the accumulated gradients, leaving a zeroed bundle behind.
    pub fn take_params_errors(&mut self) -> C::Params {
        let zero = self.grads.zeroed();
        mem::replace(&mut self.grads, zero)
    }

    /// Walks relevance from output state `to` back through state `from` and
    /// returns the input relevance at `from`. Requires the last forward
    /// pass to have saved contributions.
    ///
    /// # Arguments
    /// * `from` - The earliest state the walk descends into.
    /// * `to` - The state whose output receives `distribution`.
    /// * `distribution` - Non-negative relevance over the output of `to`.
    pub fn calculate_relevance(
        &mut self,
        from: usize,
        to: usize,
        distribution: &Array1<f64>,
    ) -> Result<Array1<f64>> {
        let steps = self.arena.in_use();
        if steps == 0 {
            return Err(RnnError::StructuralMisuse(
                "relevance before any forward pass",
            ));
        }
        if from > to || to >= steps {
            return Err(RnnError::StructuralMisuse(
                "relevance bounds outside the current sequence",
            ));
        }
        if distribution.iter().any(|r| *r < 0.0) {
            return Err(RnnError::InvalidInput(
                "negative relevance distribution".to_string(),
            ));
        }
        debug!("relevance walk from state {to} back to state {from}");
        for t in (from..=to).rev() {
            let (prev, state) = self.arena.with_prev_mut(t)?;
            if t == to {
                state.output_mut().assign_relevance(distribution.clone())?;
            } else {
                // Promote what the later state pushed onto this output.
                let promoted = state.output_mut().take_recurrent_relevance()?;
                state.output_mut().assign_relevance(promoted)?;
            }
            let slots = match prev {
                Some(prev) => Some(prev.relevance_slots()),
                None => None,
            };
            state.calculate_relevance(&self.params, slots, t > from)?;
        }
        Ok(self.arena.get(from)?.input().relevance()?.clone())
    }

    /// The activated output of timestep `index` from the last forward pass.
    pub fn output(&self, index: usize) -> Result<&Array1<f64>> {
        self.arena.get(index)?.output().values()
    }

    /// The input errors of timestep `index`, filled by a backward pass with
    /// input propagation.
    pub fn input_errors(&self, index: usize) -> Result<&Array1<f64>> {
        self.arena.get(index)?.input().errors()
    }

    /// Read access to the cell instance at timestep `index`.
    pub fn state(&self, index: usize) -> Result<&C> {
        self.arena.get(index)
    }

    pub fn last_state(&self) -> Option<usize> {
        self.arena.last_state()
    }

    /// Timesteps covered by the last forward pass.
    pub fn sequence_len(&self) -> usize {
        self.arena.in_use()
    }

    /// Cell instances built fresh during the last forward pass. Zero means
    /// the pass ran entirely on reused instances.
    pub fn allocations(&self) -> usize {
        self.arena.allocations()
    }

    /// Releases the per-timestep state, keeping parameters and gradients.
    pub fn reset(&mut self) {
        self.arena.release_all();
    }

    fn check_init(&self, init: &InitHidden) -> Result<()> {
        if init.output.len() != self.config.output_size {
            return Err(RnnError::ShapeMismatch {
                what: "initial hidden output",
                got: init.output.len(),
                expected: self.config.output_size,
            });
        }
        if let Some(cell) = &init.cell {
            if cell.len() != self.config.output_size {
                return Err(RnnError::ShapeMismatch {
                    what: "initial hidden cell state",
                    got: cell.len(),
                    expected: self.config.output_size,
                });
            }
        }
        Ok(())
    }

    fn dropout_mask(&mut self) -> Result<Option<Array1<f64>>> {
        let p = self.config.dropout;
        if p == 0.0 {
            return Ok(None);
        }
        let keep = Bernoulli::new(1.0 - p)
            .map_err(|e| RnnError::InvalidConfig(format!("dropout probability: {e}")))?;
        let scale = 1.0 / (1.0 - p);
        let mask = Array1::from_shape_fn(self.config.input_size, |_| {
            if keep.sample(&mut self.rng) {
                scale
            } else {
                0.0
            }
        });
        Ok(Some(mask))
    }
}
