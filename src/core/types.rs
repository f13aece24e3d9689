/*!
 * Core Types
 * Common types used across the heap engine
 */

/// Address type for memory operations
pub type Address = usize;

/// Size type for memory operations
pub type Size = usize;

/// Quantum count within one admin's size-class space
pub type QuantumCount = usize;
