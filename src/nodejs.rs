//! Node.js injection wrapper.
//!
//! A plain script runs in the agent's own JS runtime, not in Node's. The
//! bundled agent hops onto the target's libuv loop and evaluates the given
//! code in Node's isolate, so it can see `require`, `process` and friends.

use crate::error::Result;

const AGENT_TEMPLATE: &str = include_str!("nodejs_agent.js");
const PLACEHOLDER: &str = "__INJECTED_SOURCE__";

/// Wrap `code` so it runs on the event loop of a Node.js target.
///
/// The code is embedded as a JSON string literal, so any quoting or
/// newlines in it survive untouched.
pub fn build_injection_script(code: &str) -> Result<String> {
    let literal = serde_json::to_string(code)?;
    Ok(AGENT_TEMPLATE.replacen(PLACEHOLDER, &literal, 1))
}
