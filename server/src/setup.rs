use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};
use tracing_tree::HierarchicalLayer;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise this crate logs at debug and everything
/// else at info.
pub fn setup_tracing(crate_name: &str) -> color_eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!(
            "info,{crate_name}=debug,tower_http=debug"
        ))
    })?;

    let tree_layer = HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(tree_layer)
        .try_init()?;

    Ok(())
}
