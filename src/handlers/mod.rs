//! HTTP surfaces.

pub mod rest;
