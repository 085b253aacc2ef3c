//! Small shared helpers

pub mod retry;
