/*!
# SensorWatch DevKit - test fixtures

Helpers shared by the workspace test suites:
- `MockCarbonServer`: in-process carbon plaintext backend that records lines
- `ReadingBuilder`: MQTT topic/payload fixtures in the sensor wire format
- `init_test_tracing`: tracing output routed through the test harness
*/

pub mod carbon_stub;
pub mod readings;
pub mod test_utils;

pub use carbon_stub::{CarbonLine, MockCarbonServer};
pub use readings::ReadingBuilder;
pub use test_utils::init_test_tracing;
