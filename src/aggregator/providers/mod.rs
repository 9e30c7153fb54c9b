//! Concrete upstream providers for the market spoke
//!
//! Provider order is fixed configuration (`aggregator.provider_order`);
//! construction here only decides which providers exist.

mod ecb;
mod stooq;
mod yahoo;

pub use ecb::EcbProvider;
pub use stooq::StooqProvider;
pub use yahoo::YahooProvider;

use std::sync::Arc;

use crate::aggregator::Provider;
use crate::config::AggregatorConfig;

/// Build the full provider set from configuration. Unknown ids in
/// `provider_order` are skipped at chain time.
#[must_use]
pub fn build_providers(config: &AggregatorConfig) -> Vec<Arc<dyn Provider>> {
    vec![
        Arc::new(YahooProvider::from_config(config.providers.get("yahoo"))) as Arc<dyn Provider>,
        Arc::new(StooqProvider::from_config(config.providers.get("stooq"))) as Arc<dyn Provider>,
        Arc::new(EcbProvider::from_config(config.providers.get("ecb"))) as Arc<dyn Provider>,
    ]
}
