//! PTY Manager - one pseudo-terminal process per handle
//!
//! Each spawned PTY is owned by a small actor task. Callers talk to it through a
//! cloneable [`PtyHandle`] and observe it through a broadcast stream of
//! [`PtyEvent`]s. The crate knows nothing about sessions or sockets.
//!
//! # Example
//!
//! ```no_run
//! use pty_manager::{PtyActor, PtyConfig, PtyEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PtyConfig {
//!         command: "/bin/bash".to_string(),
//!         working_dir: Some("/tmp".to_string()),
//!         ..Default::default()
//!     };
//!
//!     let (pty, mut events) = PtyActor::spawn(config).unwrap();
//!     pty.write(b"echo hello\n").await.unwrap();
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             PtyEvent::Output(data) => print!("{}", String::from_utf8_lossy(&data)),
//!             PtyEvent::Exited { exit_code } => {
//!                 println!("exited with {:?}", exit_code);
//!                 break;
//!             }
//!         }
//!     }
//! }
//! ```

mod error;
pub mod pty;

pub use error::PtyError;
pub use pty::{PtyActor, PtyConfig, PtyEvent, PtyHandle, PtyState};
