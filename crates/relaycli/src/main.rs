use anyhow::Result;
use clap::{Parser, Subcommand};
use relaycore::{
    CallSpec, EndpointSpec, ExecutionEvent, Expression, FlowSpec, Manifest, NodeEvent, NodeSpec,
    ReferenceStore, ServiceSpec, INPUT_RESOURCE,
};
use relayruntime::{Compiler, FlowRuntime, Registry, RuntimeConfig};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay flow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow of a manifest
    Run {
        /// Path to manifest JSON file
        #[arg(short, long)]
        manifest: PathBuf,

        /// Flow to execute, defaults to the first flow of the manifest
        #[arg(short, long)]
        flow: Option<String>,

        /// Input data as JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Compile a manifest without running it
    Validate {
        /// Path to manifest JSON file
        manifest: PathBuf,
    },

    /// List available codecs and callers
    Components,

    /// Create an example manifest
    Init {
        /// Output file path
        #[arg(short, long, default_value = "relay.json")]
        output: PathBuf,
    },
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    relaycalls::register_all(&mut registry);
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { manifest, flow, input, verbose } => {
            let level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
                .init();

            run_flow(manifest, flow, input).await?;
        }

        Commands::Validate { manifest } => {
            validate_manifest(manifest)?;
        }

        Commands::Components => {
            list_components();
        }

        Commands::Init { output } => {
            create_example_manifest(output)?;
        }
    }

    Ok(())
}

async fn run_flow(path: PathBuf, flow: Option<String>, input: Option<String>) -> Result<()> {
    println!("🚀 Loading manifest from: {}", path.display());

    let manifest = Manifest::load(&path)?;
    let name = match flow {
        Some(name) => name,
        None => manifest
            .flows
            .first()
            .map(|flow| flow.name.clone())
            .ok_or_else(|| anyhow::anyhow!("Manifest defines no flows"))?,
    };

    let runtime = FlowRuntime::with_registry(Arc::new(registry()), RuntimeConfig::default());
    runtime.load_manifest(&manifest).await?;

    let flow = runtime
        .flow(&name)
        .await
        .ok_or_else(|| anyhow::anyhow!("Flow {} not found", name))?;

    println!("📋 Flow: {}", flow.name());
    println!("   Nodes: {}", flow.len());
    println!();

    let store = Arc::new(ReferenceStore::new());
    if let Some(input) = input {
        match serde_json::from_str::<serde_json::Value>(&input)? {
            serde_json::Value::Object(object) => store.store_values(INPUT_RESOURCE, "", &object),
            _ => return Err(anyhow::anyhow!("Input must be a JSON object")),
        }
    }

    let mut events = runtime.subscribe_events();

    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::FlowStarted { .. } => {
                    println!("▶️  Flow started");
                }
                ExecutionEvent::NodeStarted { node, .. } => {
                    println!("  ⚡ Starting node: {}", node);
                }
                ExecutionEvent::NodeCompleted { node, duration_ms, .. } => {
                    println!("  ✅ Node {} completed in {}ms", node, duration_ms);
                }
                ExecutionEvent::NodeSkipped { node, .. } => {
                    println!("  ⏭️  Node {} skipped", node);
                }
                ExecutionEvent::NodeFailed { node, error, .. } => {
                    println!("  ❌ Node {} failed: {}", node, error);
                }
                ExecutionEvent::NodeEvent { node, event, .. } => match event {
                    NodeEvent::Dispatched { service, method, endpoint } => {
                        println!("     📤 [{}] {} {} on {}", node, method, endpoint, service);
                    }
                    NodeEvent::Responded { service } => {
                        println!("     📥 [{}] response from {}", node, service);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", node, message);
                    }
                },
                ExecutionEvent::FlowCompleted { success, duration_ms, .. } => {
                    if success {
                        println!("✨ Flow completed successfully in {}ms", duration_ms);
                    } else {
                        println!("💥 Flow failed after {}ms", duration_ms);
                    }
                }
            }
        }
    });

    let result = runtime.execute(&name, store.clone()).await;

    // Give the event printer a moment to drain
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let result = result?;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!("   Completed: {}/{} nodes", result.completed_nodes, result.total_nodes);
    println!("   Skipped: {}", result.skipped_nodes);

    println!();
    match flow.output() {
        Some(output) => {
            let value = output.resolve(&store).unwrap_or(serde_json::Value::Null);
            println!("📤 Output:");
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        None => {
            println!("📤 Node responses:");
            for node in flow.nodes() {
                if let Some(tree) = store.load_tree(node.name(), "") {
                    println!("   {}: {}", node.name(), tree);
                }
            }
        }
    }

    Ok(())
}

fn validate_manifest(path: PathBuf) -> Result<()> {
    println!("🔍 Validating manifest: {}", path.display());

    let manifest = Manifest::load(&path)?;
    let registry = registry();
    let config = RuntimeConfig::default();
    let compiled = Compiler::new(&registry, &config, Arc::default()).compile(&manifest)?;

    println!("✅ Manifest is valid:");
    println!("   Services: {}", manifest.services.len());
    let mut names: Vec<&String> = compiled.flows.keys().collect();
    names.sort();
    for name in names {
        let flow = &compiled.flows[name];
        let order: Vec<&str> = flow.order().iter().map(|id| flow.node(*id).name()).collect();
        println!("   Flow {}: {}", name, order.join(" → "));
    }
    println!("   Endpoints: {}", compiled.endpoints.len());

    Ok(())
}

fn list_components() {
    let registry = registry();

    println!("📦 Available Codecs:");
    for name in registry.list_codecs() {
        let description = registry.codec_metadata(&name).map(|m| m.description).unwrap_or_default();
        println!("  • {}", name);
        println!("    {}", description);
    }

    println!();
    println!("📡 Available Callers:");
    for name in registry.list_callers() {
        println!("  • {}", name);
        if let Some(metadata) = registry.caller_metadata(&name) {
            println!("    {}", metadata.description);
            for (option, description) in metadata.options {
                println!("      {}: {}", option, description);
            }
        }
    }
}

fn create_example_manifest(output: PathBuf) -> Result<()> {
    let mut options = HashMap::new();
    options.insert("delay_ms".to_string(), "50".to_string());

    let flow = FlowSpec::new("greeting")
        .with_node(NodeSpec::new(
            "lookup",
            CallSpec::new("mirror").with_request(json!({
                "name": "{{ input:name }}",
                "vip": "{{ input:vip }}",
            })),
        ))
        .with_node(
            NodeSpec::new(
                "welcome",
                CallSpec::new("mirror").with_request(json!({
                    "message": "Welcome back",
                    "name": "{{ lookup:name }}",
                })),
            )
            .with_condition(Expression::Equals(json!("{{ lookup:vip }}"), json!(true))),
        )
        .with_output(json!({
            "name": "{{ lookup:name }}",
            "message": "{{ welcome:message }}",
        }));

    let mut endpoint_options = HashMap::new();
    endpoint_options.insert("endpoint".to_string(), "/greeting".to_string());

    let manifest = Manifest {
        services: vec![ServiceSpec {
            name: "mirror".to_string(),
            host: "local".to_string(),
            caller: "echo".to_string(),
            codec: "json".to_string(),
            options,
        }],
        flows: vec![flow],
        endpoints: vec![EndpointSpec {
            flow: "greeting".to_string(),
            listener: "http".to_string(),
            codec: "json".to_string(),
            options: endpoint_options,
        }],
    };

    let json = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example manifest: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  relay run --manifest {} --input '{{\"name\": \"ada\", \"vip\": true}}'",
        output.display()
    );

    Ok(())
}
