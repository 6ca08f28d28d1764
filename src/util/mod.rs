//! Utility modules.

pub(crate) mod minicron;

pub(crate) use minicron::Minicron;
