//! Pricing engine. Pure: depends only on server state and the operation.

use crate::types::{Credits, Operation, UpstreamServer};

/// Cost of a call to a server with no configured base price.
pub const DEFAULT_COST: Credits = 1;

/// MCP method that invokes a named tool.
pub const TOOL_CALL_METHOD: &str = "tools/call";

/// Resolve the credit cost of an operation against a server.
///
/// A `tools/call` naming a tool present in the server's price table costs that
/// tool's price (exact, case-sensitive match). Everything else costs the
/// server's base price, or [`DEFAULT_COST`] when none is set.
pub fn price(server: &UpstreamServer, method: &str, tool_name: Option<&str>) -> Credits {
    if method == TOOL_CALL_METHOD {
        if let Some(tool_price) = tool_name.and_then(|t| server.tool_prices.get(t)) {
            return *tool_price;
        }
    }
    server.base_price.unwrap_or(DEFAULT_COST)
}

pub fn price_operation(server: &UpstreamServer, op: &Operation) -> Credits {
    price(server, &op.method, op.tool_name.as_deref())
}
