use serde::Deserialize;
use tch::{nn, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpaceKind {
    Continuous,
    Discrete,
}

/// Shape of the action space.
/// Continuous spaces have exactly one branch whose size is the action dimensionality,
/// discrete spaces have one branch per independent categorical action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    pub kind: ActionSpaceKind,
    pub sizes: Vec<i64>,
}

impl ActionSpec {
    pub fn continuous(dims: i64) -> Self {
        Self { kind: ActionSpaceKind::Continuous, sizes: vec![dims] }
    }

    pub fn discrete(branch_sizes: Vec<i64>) -> Self {
        Self { kind: ActionSpaceKind::Discrete, sizes: branch_sizes }
    }

    pub fn num_branches(&self) -> usize {
        self.sizes.len()
    }

    /// width of an action row (and of the log prob row) handed across the env boundary
    pub fn action_width(&self) -> i64 {
        match self.kind {
            ActionSpaceKind::Continuous => self.sizes[0],
            ActionSpaceKind::Discrete => self.sizes.len() as i64,
        }
    }
}

/// Which observation modalities a model instance consumes. Fixed for the lifetime of the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationSpec {
    pub vector_size: Option<i64>,
    /// [height, width, channels] per visual input
    pub visual_shapes: Vec<[i64; 3]>,
}

impl ObservationSpec {
    pub fn has_vector(&self) -> bool {
        self.vector_size.is_some()
    }

    pub fn has_visual(&self) -> bool {
        !self.visual_shapes.is_empty()
    }
}

/// One batch of observations. Vector obs are [batch, features], visual obs are [batch, h, w, c].
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub vector: Option<&'a Tensor>,
    pub visual: &'a [Tensor],
}

impl<'a> Observation<'a> {
    pub fn vector(vector: &'a Tensor) -> Self {
        Self { vector: Some(vector), visual: &[] }
    }

    pub fn visual(visual: &'a [Tensor]) -> Self {
        Self { vector: None, visual }
    }

    pub fn new(vector: Option<&'a Tensor>, visual: &'a [Tensor]) -> Self {
        Self { vector, visual }
    }

    pub fn batch_size(&self) -> i64 {
        match (self.vector, self.visual.first()) {
            (Some(vec_obs), _) => vec_obs.size()[0],
            (None, Some(vis_obs)) => vis_obs.size()[0],
            (None, None) => panic!("observation batch has neither vector nor visual inputs"),
        }
    }
}

/// Raw distribution parameters emitted by the actor.
pub enum PolicyHead {
    /// unnormalized logits, one [batch, branch_size] tensor per branch
    Discrete(Vec<Tensor>),
    /// mean and log variance are both [batch, dims]. A network that does not learn a variance returns None.
    Continuous { mean: Tensor, log_variance: Option<Tensor> },
}

pub struct NetworkOutput {
    pub policy: PolicyHead,
    /// [batch, 1]
    pub value: Tensor,
}

// the network capability, any architecture (dense, conv, recurrent) only has to provide this
pub trait ActorCriticNetwork {
    fn forward(&self, vector_obs: Option<&Tensor>, visual_obs: &[Tensor]) -> NetworkOutput;
}

/// Builds an actor-critic network under `p`. Every trainable parameter must be created through `p`
/// so that the owning VarStore hands them to the optimizer.
pub trait NetworkBuilder {
    fn build(&self, p: &nn::Path, observation: &ObservationSpec, action: &ActionSpec) -> Box<dyn ActorCriticNetwork>;
}
