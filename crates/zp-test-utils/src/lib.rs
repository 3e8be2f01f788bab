// zp-test-utils: test doubles for the poller wire protocol.

mod mock_endpoint;

pub use mock_endpoint::{EndpointBehavior, MockEndpoint};
