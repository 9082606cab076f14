use serde::Deserialize;
use tch::{nn::{self, init, ConvConfig, LinearConfig}, Device, Tensor};

use crate::models::model_base::{
    ActionSpaceKind, ActionSpec, ActorCriticNetwork, NetworkBuilder, NetworkOutput, ObservationSpec, PolicyHead,
};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LayerConfig {
    pub num_layers: usize,
    pub layer_size: i64,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self { num_layers: 1, layer_size: 128 }
    }
}

fn default_hidden_scale() -> f64 {
    1.0
}

fn default_output_scale() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

/// Separate actor and critic encoders over every observation input, concatenated, then linear heads.
#[derive(Debug, Clone, Deserialize)]
pub struct SimpleActorCritic {
    #[serde(default)]
    pub actor: LayerConfig,
    #[serde(default)]
    pub critic: LayerConfig,
    #[serde(default = "default_hidden_scale")]
    pub hidden_weights_initial_scale: f64,
    #[serde(default = "default_output_scale")]
    pub output_weights_initial_scale: f64,
    #[serde(default)]
    pub initial_log_variance: f64,
    /// continuous only: learn a state independent log variance. Without it the head emits no variance.
    #[serde(default = "default_true")]
    pub learn_log_variance: bool,
}

impl Default for SimpleActorCritic {
    fn default() -> Self {
        Self {
            actor: LayerConfig::default(),
            critic: LayerConfig::default(),
            hidden_weights_initial_scale: default_hidden_scale(),
            output_weights_initial_scale: default_output_scale(),
            initial_log_variance: 0.,
            learn_log_variance: true,
        }
    }
}

// glorot uniform with a gain on the bound
fn glorot_config(in_dim: i64, out_dim: i64, scale: f64) -> LinearConfig {
    let bound = scale * (6.0 / (in_dim + out_dim) as f64).sqrt();
    LinearConfig { ws_init: init::Init::Uniform { lo: -bound, up: bound }, bs_init: Some(init::Init::Const(0.)), bias: true }
}

fn dense_encoder(p: &nn::Path, n_in: i64, config: LayerConfig, scale: f64) -> (nn::Sequential, i64) {
    let mut seq = nn::seq();
    let mut in_dim = n_in;
    for i in 0..config.num_layers {
        let layer_str = String::from("l") + &i.to_string();
        seq = seq.add(nn::linear(p / layer_str, in_dim, config.layer_size, glorot_config(in_dim, config.layer_size, scale)));
        seq = seq.add_fn(|xs| xs.relu());
        in_dim = config.layer_size;
    }
    (seq, in_dim)
}

fn conv_out(size: i64, kernel: i64, stride: i64) -> i64 {
    (size - kernel) / stride + 1
}

// two conv layers (8x8 stride 4, 4x4 stride 2) with elu, flattened into a dense encoder
fn visual_encoder(p: &nn::Path, shape: [i64; 3], config: LayerConfig, scale: f64) -> (nn::Sequential, i64) {
    let [height, width, channels] = shape;
    let stride = |s| ConvConfig { stride: s, ..Default::default() };
    let out_h = conv_out(conv_out(height, 8, 4), 4, 2);
    let out_w = conv_out(conv_out(width, 8, 4), 4, 2);
    assert!(
        out_h > 0 && out_w > 0,
        "visual observation of {}x{} is too small for the conv encoder (needs at least 20x20)",
        height,
        width
    );
    let flat_dim = 32 * out_h * out_w;
    let (dense, out_dim) = dense_encoder(&(p / "dense"), flat_dim, config, scale);
    let seq = nn::seq()
        // NHWC -> NCHW
        .add_fn(|xs| xs.permute([0, 3, 1, 2]))
        .add(nn::conv2d(p / "c1", channels, 16, 8, stride(4)))
        .add_fn(|xs| xs.elu())
        .add(nn::conv2d(p / "c2", 16, 32, 4, stride(2)))
        .add_fn(|xs| xs.elu().flat_view())
        .add(dense);
    (seq, out_dim)
}

struct Encoder {
    vector: Option<nn::Sequential>,
    visual: Vec<nn::Sequential>,
}

impl Encoder {
    fn new(p: &nn::Path, observation: &ObservationSpec, config: LayerConfig, scale: f64) -> (Self, i64) {
        assert!(
            observation.has_vector() || observation.has_visual(),
            "Network need at least one vector observation or visual observation"
        );
        let mut out_dim = 0;
        let vector = observation.vector_size.map(|n_in| {
            let (seq, dim) = dense_encoder(&(p / "vector"), n_in, config, scale);
            out_dim += dim;
            seq
        });
        let visual = observation
            .visual_shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| {
                let (seq, dim) = visual_encoder(&(p / format!("visual{i}")), *shape, config, scale);
                out_dim += dim;
                seq
            })
            .collect();
        (Self { vector, visual }, out_dim)
    }

    fn forward(&self, vector_obs: Option<&Tensor>, visual_obs: &[Tensor], device: Device) -> Tensor {
        let mut encoded = Vec::with_capacity(1 + self.visual.len());
        if let Some(seq) = &self.vector {
            let xs = vector_obs.expect("Must Have vector observation inputs!");
            encoded.push(xs.to_device(device).apply(seq));
        }
        assert!(visual_obs.len() >= self.visual.len(), "Must Have visual observation inputs!");
        for (seq, xs) in self.visual.iter().zip(visual_obs) {
            encoded.push(xs.to_device(device).apply(seq));
        }
        if encoded.len() == 1 {
            encoded.swap_remove(0)
        } else {
            Tensor::cat(&encoded, 1)
        }
    }
}

enum ActorHead {
    Discrete(Vec<nn::Linear>),
    Continuous { mean: nn::Linear, log_variance: Option<Tensor> },
}

pub struct SimpleActorCriticNet {
    actor_encoder: Encoder,
    critic_encoder: Encoder,
    actor: ActorHead,
    critic: nn::Linear,
    device: Device,
}

impl NetworkBuilder for SimpleActorCritic {
    fn build(&self, p: &nn::Path, observation: &ObservationSpec, action: &ActionSpec) -> Box<dyn ActorCriticNetwork> {
        Box::new(SimpleActorCriticNet::new(p, self, observation, action))
    }
}

impl SimpleActorCriticNet {
    pub fn new(p: &nn::Path, config: &SimpleActorCritic, observation: &ObservationSpec, action: &ActionSpec) -> Self {
        let actor_p = p / "actor";
        let critic_p = p / "critic";
        let (actor_encoder, actor_dim) =
            Encoder::new(&actor_p, observation, config.actor, config.hidden_weights_initial_scale);
        let (critic_encoder, critic_dim) =
            Encoder::new(&critic_p, observation, config.critic, config.hidden_weights_initial_scale);

        let out_scale = config.output_weights_initial_scale;
        let actor = match action.kind {
            ActionSpaceKind::Discrete => ActorHead::Discrete(
                action
                    .sizes
                    .iter()
                    .enumerate()
                    .map(|(i, &n_act)| {
                        nn::linear(&actor_p / format!("alout{i}"), actor_dim, n_act, glorot_config(actor_dim, n_act, out_scale))
                    })
                    .collect(),
            ),
            ActionSpaceKind::Continuous => {
                let n_act = action.sizes[0];
                let mean = nn::linear(&actor_p / "alout", actor_dim, n_act, glorot_config(actor_dim, n_act, out_scale));
                let log_variance = config
                    .learn_log_variance
                    .then(|| actor_p.var("log_variance", &[n_act], init::Init::Const(config.initial_log_variance)));
                ActorHead::Continuous { mean, log_variance }
            }
        };
        let critic = nn::linear(&critic_p / "clout", critic_dim, 1, glorot_config(critic_dim, 1, out_scale));

        Self { actor_encoder, critic_encoder, actor, critic, device: p.device() }
    }
}

impl ActorCriticNetwork for SimpleActorCriticNet {
    fn forward(&self, vector_obs: Option<&Tensor>, visual_obs: &[Tensor]) -> NetworkOutput {
        let actor_hidden = self.actor_encoder.forward(vector_obs, visual_obs, self.device);
        let critic_hidden = self.critic_encoder.forward(vector_obs, visual_obs, self.device);

        let policy = match &self.actor {
            ActorHead::Discrete(branches) => {
                PolicyHead::Discrete(branches.iter().map(|branch| actor_hidden.apply(branch)).collect())
            }
            ActorHead::Continuous { mean, log_variance } => {
                let mean = actor_hidden.apply(mean);
                let log_variance = log_variance.as_ref().map(|log_var| log_var.expand_as(&mean));
                PolicyHead::Continuous { mean, log_variance }
            }
        };
        NetworkOutput { policy, value: critic_hidden.apply(&self.critic) }
    }
}
