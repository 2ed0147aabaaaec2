pub mod duration;
pub mod experiment;
pub mod rollout;
