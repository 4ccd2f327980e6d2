//! Integration test modules

mod certificate_authority;
mod node_bootstrap;
mod startup_sequence;
