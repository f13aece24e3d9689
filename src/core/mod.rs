/*!
 * Core Module
 * Shared types and tunables
 */

pub mod limits;
pub mod types;

pub use types::*;
