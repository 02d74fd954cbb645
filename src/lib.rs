//! mockd
//!
//! A mock API engine. Requests to `/mock/<projectId>/<path>` are resolved
//! against a project's mock definitions and answered either from a sandboxed
//! data template or by proxying to an upstream.
//!
//! # Features
//!
//! - **Route Resolution**: `{name}` path patterns, first match wins
//! - **Parameter Validation**: declared parameters checked against the query or body
//! - **Data Templates**: `name|rule` keys and `@placeholders` evaluated in QuickJS
//!   under time, memory and stack limits
//! - **Response Control**: `_res` sets status, headers, cookies and payload
//! - **Proxy Mode**: forward to an upstream URL template with the captured parameters
//! - **JSONP**: wrap the body in a callback on request
//! - **Definition Cache**: per-project snapshots, invalidated on every write
//!
//! # Example Configuration
//!
//! ```yaml
//! projects:
//!   - id: 5a0f4e6b3c2d1e0f9a8b7c6d
//!     base_path: /api
//!     mocks:
//!       - url: /users/{id}
//!         method: get
//!         description: One user
//!         mode: "{ id: function (o) { return o._req.params.id; }, name: '@name' }"
//! ```

pub mod cache;
pub mod config;
pub mod counter;
pub mod dispatcher;
pub mod error;
pub mod matcher;
pub mod model;
pub mod proxy;
pub mod repository;
pub mod server;
pub mod store;
pub mod synthesizer;
pub mod template;
pub mod validator;

pub use config::MockServerConfig;
pub use dispatcher::{Dispatcher, MockRequest, MockResponse};
pub use error::{MockError, MockResult};
pub use store::DefinitionStore;
