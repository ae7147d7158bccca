//! Model-guided IPv6 address discovery.
//!
//! The pipeline learns nibble statistics from confirmed-live addresses,
//! samples new candidates from them, probes the candidates with an external
//! scanner and folds the responders back into the corpus.

pub mod blacklist;
pub mod bootstrap;
pub mod cluster;
pub mod corpus;
pub mod model;
pub mod persistence;
pub mod pipeline;
pub mod prober;
pub mod seed;
