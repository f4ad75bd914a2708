use anyhow::Result;
use quill::api::ApiClient;
use quill::config::Config;
use quill::frontend::Frontend;
use quill::history::HistoryStore;
use quill::logging;
use quill::permissions::PermissionState;
use quill::session::Session;
use quill::tools::{plugins, ToolGateway, ToolRegistry, ToolSandbox};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let mut registry = ToolRegistry::new();
    if let Some(plugin_dir) = &config.plugin_dir {
        for (spec, path) in plugins::discover_plugins(plugin_dir) {
            let name = spec.name.clone();
            if !registry.register_plugin(spec, path) {
                logging::emit_message(&format!(
                    "WARN plugin_name_collision name={name} dir={}",
                    plugin_dir.display()
                ));
            }
        }
    }
    let tool_names = registry.names();

    let client = Arc::new(ApiClient::new(&config, registry.specs().to_vec())?);
    let sandbox = ToolSandbox::new(config.working_dir.clone(), config.exclude_patterns.clone());
    let gateway = ToolGateway::new(registry, sandbox, config.tool_timeout);
    let permissions = PermissionState::new(config.permitted_tools.iter().cloned());
    let store = config.session_dir.clone().map(HistoryStore::new);

    let (session, channels) = Session::new(
        client,
        gateway,
        permissions,
        store,
        config.max_tool_rounds,
    );
    let session_task = tokio::spawn(session.run());

    Frontend::new(channels, tool_names).run().await?;

    session_task.abort();
    Ok(())
}
