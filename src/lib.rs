// ============================================================================
// Linting
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![deny(dead_code)]                   // Dead code is forbidden
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments

// Tests may unwrap and panic freely
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Clusterforge
//!
//! A lifecycle reconciliation engine for Kubernetes clusters described by a
//! single declarative YAML document.
//!
//! ## Overview
//!
//! A cluster is brought to its configuration in three phases, each split in
//! pre, core and post sub-phases:
//!
//! 1. **Infrastructure**: network and VPN, provisioned with Terraform
//! 2. **Kubernetes**: the control plane and nodes, provisioned with Terraform
//! 3. **Distribution**: in-cluster modules, applied with kubectl
//!
//! Before anything runs, the preflight checks compare the configuration with
//! the last successfully applied one, reject changes that the distribution's
//! rules forbid and select the migrations (reducers) the changes require.
//! Sub-phase outcomes are persisted so that a failed run resumes where it
//! stopped.
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, validation and the merge model
//! - [`planner`]: Config diff, rules manifest and Terraform plan parsing
//! - [`runner`]: External tool runners with a shared stop lifecycle
//! - [`phase`]: The lifecycle phases and their working directories
//! - [`reconciler`]: The sub-phase state machine
//! - [`state`]: State storage backends (local, S3)
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: kfd.sighup.io/v1alpha2
//! kind: EKSCluster
//! metadata:
//!   name: demo
//! spec:
//!   distributionVersion: v1.29.0
//!   region: eu-west-1
//!   infrastructure:
//!     vpc:
//!       network:
//!         cidr: 10.0.0.0/16
//!   kubernetes:
//!     nodePools:
//!       - name: workers
//!         size: { min: 1, max: 3 }
//!   distribution:
//!     modules:
//!       ingress:
//!         nginx:
//!           type: single
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod phase;
pub mod planner;
pub mod reconciler;
pub mod runner;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ClusterConfig, ConfigHasher, ConfigParser, ConfigValidator};
pub use error::{ForgeError, Result};
pub use phase::{Phase, SubPhase};
pub use reconciler::{ApplyOptions, ClusterReconciler, ReconciliationResult};
pub use state::{ClusterStateStore, LocalStateStore, S3StateStore};
