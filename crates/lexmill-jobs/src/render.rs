//! Prompt rendering for one work item.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, warn};

use lexmill_core::EntitySnapshot;

use crate::clustering::{ClusterOutcome, ClusteringAdapter};
use crate::template::{flatten_context, is_loop_template, render_flat, Template};

/// Collections a template may iterate.
pub const KNOWN_COLLECTIONS: &[&str] = &["roles", "related", "siblings", "members", "child_frames"];

/// Collections that can be reordered by cluster.
pub const CLUSTERABLE_COLLECTIONS: &[&str] = &["siblings", "child_frames"];

/// Injected at the top of every clustered loop body.
const CLUSTER_HEADER: &str = "{% if {var}.cluster_changed %}Cluster {{ {var}.cluster }}:\n{% endif %}";

/// Per-render switches taken from the job config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    pub cluster: bool,
    pub cluster_k: Option<usize>,
}

/// Output of [`PromptRenderer::render`].
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPrompt {
    pub prompt: String,
    /// Flat string view of the render context.
    pub variables: BTreeMap<String, String>,
    /// Non-fatal problems, e.g. a loop-mode failure that fell back to flat.
    pub warnings: Vec<String>,
    /// Advisory when clustering was requested but not applied.
    pub cluster_notice: Option<String>,
}

/// Build the render context of a snapshot.
pub fn template_context(snapshot: &EntitySnapshot) -> Map<String, JsonValue> {
    let mut ctx = snapshot.flat_record();
    let to_value = |v: serde_json::Result<JsonValue>| v.unwrap_or(JsonValue::Array(Vec::new()));
    ctx.insert("roles".into(), to_value(serde_json::to_value(&snapshot.roles)));
    ctx.insert("related".into(), to_value(serde_json::to_value(&snapshot.related)));
    ctx.insert("siblings".into(), to_value(serde_json::to_value(&snapshot.siblings)));
    ctx.insert("members".into(), to_value(serde_json::to_value(&snapshot.members)));
    ctx.insert(
        "child_frames".into(),
        to_value(serde_json::to_value(&snapshot.child_frames)),
    );
    if snapshot.frame_id.is_some() {
        ctx.insert(
            "frame".into(),
            json!({
                "id": snapshot.frame_id,
                "code": snapshot.frame_code,
                "name": snapshot.frame_name,
            }),
        );
    }
    ctx
}

/// Non-fatal template problems.
pub fn validate(template: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if template.trim().is_empty() {
        warnings.push("template is empty".to_string());
        return warnings;
    }
    if !is_loop_template(template) {
        if template.contains("{%") {
            warnings.push("block tag outside loop syntax will render literally".to_string());
        }
        return warnings;
    }
    match Template::parse(template) {
        Ok(parsed) => {
            for collection in parsed.loop_collections() {
                let root = collection.split('.').next().unwrap_or_default();
                if !KNOWN_COLLECTIONS.contains(&root) {
                    warnings.push(format!("unknown collection '{collection}'"));
                }
            }
        }
        Err(e) => warnings.push(format!("{e}; prompts will use plain substitution")),
    }
    warnings
}

/// Stateless prompt renderer.
#[derive(Clone, Default)]
pub struct PromptRenderer {
    clustering: Option<ClusteringAdapter>,
}

impl PromptRenderer {
    pub fn new(clustering: Option<ClusteringAdapter>) -> Self {
        Self { clustering }
    }

    /// Render `template` for `snapshot`. Never fails: loop-mode problems fall
    /// back to flat substitution and are reported as warnings.
    pub async fn render(
        &self,
        template: &str,
        snapshot: &EntitySnapshot,
        options: RenderOptions,
    ) -> RenderedPrompt {
        let mut ctx = template_context(snapshot);
        let variables = flatten_context(&ctx);
        let mut warnings = Vec::new();
        let mut cluster_notice = None;

        if !is_loop_template(template) {
            return RenderedPrompt {
                prompt: render_flat(template, &variables),
                variables,
                warnings,
                cluster_notice,
            };
        }

        let prompt = match Template::parse(template) {
            Ok(mut parsed) => {
                if options.cluster {
                    cluster_notice = self
                        .apply_clustering(&mut parsed, &mut ctx, options.cluster_k)
                        .await;
                }
                match parsed.render(&ctx) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(
                            subsystem = "jobs",
                            component = "renderer",
                            entity = %snapshot.target,
                            error = %e,
                            "Loop render failed, using flat substitution"
                        );
                        warnings.push(e.to_string());
                        render_flat(template, &variables)
                    }
                }
            }
            Err(e) => {
                debug!(
                    subsystem = "jobs",
                    component = "renderer",
                    error = %e,
                    "Template did not parse, using flat substitution"
                );
                warnings.push(e.to_string());
                render_flat(template, &variables)
            }
        };

        RenderedPrompt {
            prompt,
            variables,
            warnings,
            cluster_notice,
        }
    }

    /// Reorder clusterable collections the template iterates and inject the
    /// cluster header. Returns an advisory when clustering was not applied.
    async fn apply_clustering(
        &self,
        template: &mut Template,
        ctx: &mut Map<String, JsonValue>,
        k: Option<usize>,
    ) -> Option<String> {
        let targets: Vec<String> = template
            .loop_collections()
            .into_iter()
            .filter(|c| CLUSTERABLE_COLLECTIONS.contains(&c.as_str()))
            .collect();
        if targets.is_empty() {
            return Some("clustering requested but the template iterates no clusterable collection".into());
        }
        let Some(adapter) = &self.clustering else {
            return Some("clustering service is not configured".into());
        };

        let mut notices = Vec::new();
        for collection in targets {
            let items = match ctx.get(&collection) {
                Some(JsonValue::Array(items)) => items.clone(),
                _ => continue,
            };
            let ids: Vec<i64> = items
                .iter()
                .filter_map(|i| i.get("id").and_then(JsonValue::as_i64))
                .collect();

            match adapter.cluster(&ids, k).await {
                ClusterOutcome::Clustered { slots, .. } => {
                    let mut by_id: BTreeMap<i64, JsonValue> = items
                        .into_iter()
                        .filter_map(|i| i.get("id").and_then(JsonValue::as_i64).map(|id| (id, i)))
                        .collect();
                    let mut previous = None;
                    let reordered: Vec<JsonValue> = slots
                        .iter()
                        .filter_map(|slot| {
                            let mut item = by_id.remove(&slot.id)?;
                            if let JsonValue::Object(map) = &mut item {
                                map.insert("cluster".into(), json!(slot.cluster));
                                map.insert(
                                    "cluster_changed".into(),
                                    json!(previous != Some(slot.cluster)),
                                );
                            }
                            previous = Some(slot.cluster);
                            Some(item)
                        })
                        .collect();
                    ctx.insert(collection.clone(), JsonValue::Array(reordered));
                    if let Err(e) = template.inject_loop_prefix(&collection, CLUSTER_HEADER) {
                        notices.push(format!("{collection}: {e}"));
                    }
                }
                ClusterOutcome::Unavailable { reason } => {
                    notices.push(format!("{collection} not clustered: {reason}"));
                }
            }
        }
        if notices.is_empty() {
            None
        } else {
            Some(notices.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexmill_core::{EntryBrief, TargetRef};
    use lexmill_inference::mock::MockClusteringService;
    use std::sync::Arc;

    fn brief(id: i64, lemma: &str) -> EntryBrief {
        EntryBrief {
            id,
            code: None,
            lemma: lemma.into(),
            pos: Some("verb".into()),
            gloss: None,
            frame_id: Some(10),
            flagged: false,
            flagged_reason: None,
        }
    }

    fn snapshot() -> EntitySnapshot {
        let mut s = EntitySnapshot::new(TargetRef::Entry(1), "run");
        s.pos = Some("verb".into());
        s.gloss = Some("move fast on foot".into());
        s.frame_id = Some(10);
        s.frame_name = Some("Motion".into());
        s.siblings = vec![
            brief(2, "walk"),
            brief(3, "sprint"),
            brief(4, "jog"),
            brief(5, "amble"),
        ];
        s
    }

    #[tokio::test]
    async fn test_flat_template() {
        let out = PromptRenderer::default()
            .render("{{lemma}} in {{frame_name}}: {{unknown}}", &snapshot(), RenderOptions::default())
            .await;
        assert_eq!(out.prompt, "run in Motion: ");
        assert_eq!(out.variables["lemma"], "run");
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_loop_falls_back_to_flat() {
        let template = "Word {{lemma}} {% for s in siblings %}{{ s.lemma }}";
        let out = PromptRenderer::default()
            .render(template, &snapshot(), RenderOptions::default())
            .await;
        let vars = flatten_context(&template_context(&snapshot()));
        assert_eq!(out.prompt, render_flat(template, &vars));
        assert!(!out.prompt.is_empty());
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_cluster_headers_injected() {
        let service = Arc::new(MockClusteringService::new());
        let renderer = PromptRenderer::new(Some(ClusteringAdapter::new(service)));
        let options = RenderOptions {
            cluster: true,
            cluster_k: Some(2),
        };
        let out = renderer
            .render("{% for s in siblings %}- {{ s.lemma }}\n{% endfor %}", &snapshot(), options)
            .await;
        // Round-robin mock: walk, jog -> 1; sprint, amble -> 2.
        assert_eq!(
            out.prompt,
            "Cluster 1:\n- walk\n- jog\nCluster 2:\n- sprint\n- amble\n"
        );
        assert!(out.cluster_notice.is_none());
    }

    #[tokio::test]
    async fn test_cluster_without_service_is_advisory() {
        let options = RenderOptions {
            cluster: true,
            cluster_k: None,
        };
        let out = PromptRenderer::default()
            .render("{% for s in siblings %}{{ s.lemma }} {% endfor %}", &snapshot(), options)
            .await;
        assert_eq!(out.prompt, "walk sprint jog amble ");
        assert!(out.cluster_notice.unwrap().contains("not configured"));
    }

    #[test]
    fn test_validate() {
        assert!(validate("{{lemma}}").is_empty());
        assert_eq!(validate("  ").len(), 1);
        assert!(validate("{% for x in widgets %}{% endfor %}")[0].contains("widgets"));
        assert!(!validate("{% for x in siblings %}").is_empty());
    }
}
