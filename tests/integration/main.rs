//! Integration suite: full sessions against a scripted in-memory gateway.

mod mock_gateway;
mod session_flow;
