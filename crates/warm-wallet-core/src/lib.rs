// Library root: the wallet/suggester orchestration core and the concrete
// collaborators it runs against (SQLite store, contract registry, especial
// WebSocket client).

pub mod answers;
pub mod config;
pub mod db;
pub mod especial;
pub mod identity;
pub mod registry;
pub mod session;
pub mod state;
pub mod wallet;
