//! Consolidated test modules.
//!
//! End-to-end runs of the whole provisioning sequence.
