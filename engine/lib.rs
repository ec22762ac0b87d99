#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod beta;
pub mod config;
pub mod coverage;
pub mod data;
pub mod em;
pub mod evaluate;
pub mod glm;
pub mod output;
pub mod prior;
pub mod regression;
pub mod smoothing;
pub mod types;
