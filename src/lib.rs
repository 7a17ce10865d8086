//! # admpi-rs
//!
//! `admpi-rs` is a differentiable message-passing layer. It sits between an
//! operator-overloading AD tool and a message-passing transport, so that a program that
//! communicates AD-active values still yields correct gradients: every communication
//! done in the forward run is recorded, and the reverse sweep replays it along the
//! transpose of its data flow.
//!
//! ## Modules
//!
//! - [`transport`]: The byte-oriented transport boundary, plus an in-process reference
//!   transport where every rank is a thread.
//! - [`tool`]: The AD adapter contract ([`AdTool`]) and two adapters, a passive one and a
//!   small recording [`Tape`].
//! - [`types`]: Element descriptors: active scalars, passive data, value/location pairs
//!   and composed structs.
//! - [`op`]: Reduction operators and their adjoints.
//! - [`request`]: Requests with completion continuations and the `wait_*`/`test_*` family.
//! - [`comm`]: The differentiable communicator, [`AdComm`].
//!
//! ## Example
//!
//! ```rust
//! use admpi_rs::{AdComm, ActiveType, Input, LocalWorld, Operator, Tape};
//! use std::thread;
//!
//! let handles: Vec<_> = LocalWorld::new(3)
//!     .into_iter()
//!     .map(|endpoint| {
//!         thread::spawn(move || {
//!             let tape = Tape::new();
//!             let comm = AdComm::new(endpoint.into_comm(), tape.clone());
//!             let ty = ActiveType::<Tape>::new();
//!             tape.set_active();
//!
//!             let x = tape.input(comm.rank() as f64 + 1.0);
//!             let mut total = vec![Default::default()];
//!             let sum = Operator::sum();
//!             comm.allreduce(Input::Buf(&[x.clone()]), &mut total, &ty, &sum).unwrap();
//!             assert_eq!(total[0].value(), 6.0);
//!
//!             tape.set_passive();
//!             tape.set_gradient(total[0].index(), 1.0);
//!             tape.evaluate().unwrap();
//!             // Every rank's result depends on every input.
//!             assert_eq!(tape.gradient(x.index()), 3.0);
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! ```

pub mod comm;
pub mod error;
pub mod op;
pub mod request;
mod reverse;
pub mod tool;
pub mod transport;
pub mod types;

#[doc(hidden)]
pub mod __private {
    pub use tracing;
}

pub use comm::collective::Blocks;
pub use comm::{shared, AdComm, Input, Output, Persistent, SharedBuf};
pub use error::{Error, Result};
pub use op::{OpKind, Operator};
pub use request::Request;
pub use tool::{AdTool, PassiveTool, Tape};
pub use transport::{LocalComm, LocalWorld, Source, Status, Tag, Transport};
pub use types::{ActiveType, DataType, Loc, PassiveType, StructType, ValueLocType};
