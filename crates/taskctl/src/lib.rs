//! Local task scheduler backed by detached tmux sessions.

pub mod controller;
pub mod logfile;
pub mod monitor;
pub mod reconcile;
pub mod render;
pub mod resources;
pub mod state_machine;
pub mod store;

pub use controller::*;
pub use monitor::*;
pub use reconcile::*;
pub use render::*;
pub use resources::*;
pub use state_machine::*;
pub use store::*;
