// src/activation/mod.rs

//! Activation: choosing the live package versions and making them live
//!
//! [`resolver`] decides, [`mount`] applies.

pub mod mount;
pub mod resolver;

pub use mount::{Alias, DirectoryMounter, Mount, MountBackend, MountPlan, PlanDiff};
pub use resolver::{ActiveSet, Resolution, UnresolvedLibrary, resolve};
