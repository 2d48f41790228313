//! Centralized constants for the alb-ingress project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod alb;
pub mod annotations;
pub mod network;
pub mod paths;
