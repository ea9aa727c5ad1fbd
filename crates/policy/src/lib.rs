//! Block policy: configuration plus the rule evaluator that turns visit
//! history into the set of domains that should be blocked right now.

pub mod config;
pub mod evaluate;

pub use {
    config::{BrowserConfig, ConfigError, DynamicRule, PolicyConfig},
    evaluate::{Evaluation, evaluate},
};
