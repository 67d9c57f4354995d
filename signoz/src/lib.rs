pub mod client;
pub mod config;
mod console_exporter;
pub mod error;
pub mod http;
pub mod otel_provider;
pub mod process_metrics;
pub mod propagation;
pub mod resources;
pub mod telemetry_scope;

pub use client::InstrumentedClient;
pub use config::AppInfo;
pub use config::OtlpProtocol;
pub use config::SignozSettings;
pub use console_exporter::ConsoleExporter;
pub use console_exporter::ConsoleFormat;
pub use console_exporter::ConsoleMetricExporter;
pub use error::Signal;
pub use error::SignozError;
pub use otel_provider::SignozProvider;
pub use otel_provider::install_subscriber;
pub use resources::ResourceCollection;
pub use resources::ScopedResource;
pub use resources::on_release;
pub use telemetry_scope::Failure;
pub use telemetry_scope::ScopeFactory;
pub use telemetry_scope::TelemetryScope;
