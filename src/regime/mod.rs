pub mod classifier;

pub use classifier::{MicrostructureBias, Regime, RegimeClassifier, RegimeInputs};
