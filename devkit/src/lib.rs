/*!
# PrintMesh DevKit - Simulated broker and test harness

Library for exercising PrintMesh nodes without a real broker:
- In-memory broker with retained messages, last will and wildcard routing
- Abrupt connection drop injection
- Multi-node harness driven by a shared manual clock
*/

pub mod sim_broker;
pub mod test_utils;

pub use sim_broker::{SimBroker, SimMessage};
pub use test_utils::TestHarness;
