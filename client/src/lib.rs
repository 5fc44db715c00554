//! Headless game client: fetches an assignment from the directory, holds the
//! master and bootstrap connections, and runs a bot that submits updates
//! while mirroring the committed state the server broadcasts.

pub mod game;
pub mod network;
