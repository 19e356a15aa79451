// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![warn(dead_code)]                   // Unused code is reported
#![warn(unused_imports)]              // Unused imports are reported
#![warn(unused_variables)]            // Unused variables are reported
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// Tests may unwrap and panic freely.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Provision Pilot
//!
//! An idempotent provisioning reconciliation engine for application projects.
//!
//! ## Overview
//!
//! A repository event (project, ref, commit) is turned into a desired set of
//! cloud resources: project, role bindings, build trigger, database, secrets,
//! topics, serving deployment and DNS records. Provision Pilot then:
//!
//! - Compares each desired resource with the last successfully applied state
//! - Builds a dependency-ordered plan of creates, updates and deletes
//! - Executes the plan under an exclusive per-project lease
//! - Checkpoints every operation so an interrupted run resumes safely
//! - Records a per-resource audit of every run
//!
//! ## Architecture
//!
//! 1. **Desired State**: Built by the [`trigger`] from a project manifest in `provision-pilot.yaml`
//! 2. **Applied State**: Records kept by a [`state::StateStore`]
//! 3. **Planner**: Diffs the two by checksum and orders operations by kind
//! 4. **Reconciler**: Executes the plan through one [`driver::ResourceDriver`] per kind
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`resource`]: Resource kinds, descriptors and checksums
//! - [`state`]: State storage backends (memory, local, S3)
//! - [`driver`]: Resource drivers and the provisioning gateway client
//! - [`planner`]: Diff computation and execution planning
//! - [`reconciler`]: Plan execution, retries, leases and drift inspection
//! - [`trigger`]: Desired state construction and the deployment entry point
//! - [`notify`]: Chat notifications for settled triggers
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! state:
//!   backend: local
//!
//! projects:
//!   - id: shop
//!     region: europe-west1
//!     app:
//!       name: api
//!       repository: org/shop-api
//!       build:
//!         branch: main
//!     database:
//!       instance: shop-db
//!       name: shop
//!     secrets:
//!       - name: django-key
//!         generate: { length: 50 }
//!         expose_as: SECRET_KEY
//!     domains:
//!       - name: shop.example.com
//!         zone: example-com
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod notify;
pub mod planner;
pub mod reconciler;
pub mod resource;
pub mod state;
pub mod trigger;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, PilotConfig};
pub use driver::{DriverRegistry, ProviderHandle, ProvisioningClient, ResourceDriver};
pub use error::{PilotError, Result};
pub use planner::{Action, Operation, Plan, PlanBuilder};
pub use reconciler::{DriftReport, ReconciliationRun, Reconciler, RetryPolicy, RunStatus};
pub use resource::{RemovalMarker, ResourceDescriptor, ResourceKey, ResourceKind};
pub use state::{AppliedRecord, LocalStateStore, MemoryStateStore, S3StateStore, StateStore};
pub use trigger::{DeploymentTrigger, RunSummary};
