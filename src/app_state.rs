use std::sync::Arc;

use tokio::sync::mpsc;

use crate::auth::TokenAuthenticator;
use crate::billing::ledger::Ledger;
use crate::billing::settlement::NodeExecutionRecord;
use crate::registry::RouteRegistry;
use crate::upstream::Forwarder;

/// Shared application state bundled into a single Arc-wrapped struct.
///
/// A single `Arc<AppState>` is cloned once per connection and passed to the
/// request handlers.
pub struct AppState {
    pub registry: RouteRegistry,
    pub authenticator: TokenAuthenticator,
    pub ledger: Arc<Ledger>,
    pub forwarder: Forwarder,
    pub settlement_tx: mpsc::Sender<NodeExecutionRecord>,
}
