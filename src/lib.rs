//! Nanomite-based branch protection for x86/x64 PE images.
//!
//! Two halves share this crate:
//!
//! - [`builder`] locates every relative branch in a named section, replaces
//!   each with a software breakpoint padded by random bytes, and emits a
//!   sorted [`nanomite::NanomiteTable`] describing the original semantics.
//! - [`tracer`] installs a first-chance trap handler inside the protected
//!   process, resolves each trap against the table, and rewrites the
//!   faulting thread's instruction pointer as the original branch would
//!   have.
//!
//! [`classifier`] and [`branch`] are the pieces both halves depend on:
//! instruction-length/relative-branch detection, and the closed enumeration
//! of branch semantics plus its pure evaluation function.

pub mod branch;
pub mod builder;
pub mod classifier;
pub mod error;
pub mod nanomite;
pub mod pe;
pub mod resource;

pub mod cpu_state;
pub mod runtime_loader;
pub mod tracer;
