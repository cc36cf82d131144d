use std::path::Path;
use std::process::ExitCode;

use serde_json::json;

use orchard_bootstrap::DependencyGraph;
use orchard_core::{HostConfig, Lifetime};

pub fn plan(config_path: &Path, format: &str) -> anyhow::Result<ExitCode> {
    let config = super::load_config(config_path, None)?;
    let graph = DependencyGraph::build(&config.resources)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&plan_json(&config, &graph))?),
        _ => print!("{}", format_plan(&config, &graph)),
    }
    Ok(ExitCode::SUCCESS)
}

fn plan_json(config: &HostConfig, graph: &DependencyGraph) -> serde_json::Value {
    let order: Vec<serde_json::Value> = graph
        .order()
        .map(|decl| {
            json!({
                "name": decl.name,
                "kind": decl.kind,
                "lifetime": decl.lifetime,
                "depends_on": graph.direct_dependencies(&decl.name),
            })
        })
        .collect();
    json!({
        "order": order,
        "app": {
            "waits_for": config.app.direct_dependencies(),
            "features": config.app.features,
        },
        "tenants": config.tenants.iter().map(|t| json!({
            "name": t.name,
            "recipe": t.recipe,
        })).collect::<Vec<_>>(),
    })
}

fn format_plan(config: &HostConfig, graph: &DependencyGraph) -> String {
    let mut out = format!("Startup order ({} resources):\n", graph.len());
    for (i, decl) in graph.order().enumerate() {
        let lifetime = match decl.lifetime {
            Lifetime::Persistent => ", persistent",
            Lifetime::Ephemeral => "",
        };
        out.push_str(&format!("  {}. {} [{}{}]", i + 1, decl.name, decl.kind, lifetime));
        let deps = graph.direct_dependencies(&decl.name);
        if !deps.is_empty() {
            out.push_str(&format!(" <- {}", deps.join(", ")));
        }
        out.push('\n');
    }

    let waits = config.app.direct_dependencies();
    if !waits.is_empty() {
        out.push_str(&format!("Application waits for: {}\n", waits.join(", ")));
    }
    for (i, flag) in config.app.features.iter().enumerate() {
        out.push_str(&format!("Feature {}: {flag}\n", i + 1));
    }
    for tenant in &config.tenants {
        out.push_str(&format!("Tenant {} <- recipe {}\n", tenant.name, tenant.recipe));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[[resources]]
name = "mysql"
kind = "engine-instance"
lifetime = "persistent"

[[resources]]
name = "ContentDb"
kind = "logical-database"
depends_on = ["mysql"]

[app]
command = ["orchard-app"]
wait_for = ["ContentDb"]
features = ["OrchardCore.Contents"]
"#;

    fn fixture() -> (HostConfig, DependencyGraph) {
        let config = HostConfig::parse(CONFIG).unwrap();
        let graph = DependencyGraph::build(&config.resources).unwrap();
        (config, graph)
    }

    #[test]
    fn text_plan_lists_order_and_dependencies() {
        let (config, graph) = fixture();
        let text = format_plan(&config, &graph);
        assert!(text.contains("1. mysql [engine-instance, persistent]"));
        assert!(text.contains("2. ContentDb [logical-database] <- mysql"));
        assert!(text.contains("Application waits for: ContentDb"));
        assert!(text.contains("Feature 1: OrchardCore.Contents"));
    }

    #[test]
    fn json_plan_uses_config_names() {
        let (config, graph) = fixture();
        let value = plan_json(&config, &graph);
        assert_eq!(value["order"][0]["name"], "mysql");
        assert_eq!(value["order"][0]["kind"], "engine-instance");
        assert_eq!(value["order"][1]["depends_on"][0], "mysql");
        assert_eq!(value["app"]["waits_for"][0], "ContentDb");
    }
}
