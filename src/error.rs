// src/error.rs
//! Error handling for the whole crate.
//!
//! One `thiserror`-derived enum covers both the three vDNN error kinds
//! (`PlannerInfeasible`, `FatalPrimitive`, `Invariant`) and the ambient
//! plumbing errors (config parsing, I/O) that any entry point needs.

use std::fmt;
use thiserror::Error;

/// Main error type — lightweight, Send + Sync + 'static.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No candidate plan in `choose_plan`'s priority table confirmed feasible.
    #[error("no feasible plan: {reason}")]
    PlannerInfeasible { reason: String },

    /// The accelerator (DNN primitive call or device<->host copy) reported
    /// a non-recoverable failure. Aborts the in-flight step.
    #[error("fatal accelerator error at layer {layer}, op {op}: {detail}")]
    FatalPrimitive {
        layer: usize,
        op: &'static str,
        detail: String,
    },

    /// A detected invariant breach (size mismatch, alias violation, ...).
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// I/O errors (config loading, crash logs).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config deserialization failures.
    #[error("config error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Opaque wrapper for any other error (foreign crates).
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Simple custom message (allocation only when error happens).
    #[error("{0}")]
    Custom(String),

    /// Rich context chaining (like anyhow but zero-cost when you control the types).
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a custom error message (zero-cost when possible).
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Create a formatted custom error (like `format!` but returns `Error`).
    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    /// Add context to any error (chainable, like `.context()` in anyhow).
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Quick static message (no allocation if you pass `&'static str`).
    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn planner_infeasible<S: Into<String>>(reason: S) -> Self {
        Self::PlannerInfeasible { reason: reason.into() }
    }

    #[inline]
    pub fn fatal_primitive<S: Into<String>>(layer: usize, op: &'static str, detail: S) -> Self {
        Self::FatalPrimitive { layer, op, detail: detail.into() }
    }

    #[inline]
    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        Self::Invariant(msg.into())
    }

    // === High-performance kind checks (branch prediction friendly) ===
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    #[inline]
    pub fn is_planner_infeasible(&self) -> bool {
        matches!(self, Error::PlannerInfeasible { .. })
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalPrimitive { .. })
    }

    #[inline]
    pub fn is_custom(&self) -> bool {
        matches!(self, Error::Custom(_))
    }
}

/// Convenient `Result` alias — use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;
