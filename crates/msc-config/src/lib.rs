//! Consumer configuration.
//!
//! YAML layers are merged left to right into one JSON document, which is
//! hashed in canonical form so a replay can be tied to the exact settings it
//! ran with. Typed access goes through [`ConsumerSettings`].

mod guard;
mod layered;
mod secrets;
mod settings;
mod unused;

pub use layered::{load_layered_yaml, load_layered_yaml_from_strings, LoadedConfig};
pub use secrets::{resolve_database_url, ResolvedDatabaseUrl};
pub use settings::{ConsumerSection, ConsumerSettings, DatabaseSection, QueueSection};
pub use unused::{report_unused_keys, UnusedKeyPolicy, UnusedKeyReport, CONSUMED_POINTERS};

/// Every scalar leaf of `v` with its JSON pointer, in document (key) order.
pub(crate) fn leaves(v: &serde_json::Value) -> Vec<(String, &serde_json::Value)> {
    fn walk<'a>(
        v: &'a serde_json::Value,
        at: String,
        out: &mut Vec<(String, &'a serde_json::Value)>,
    ) {
        match v {
            serde_json::Value::Object(map) => {
                for (k, child) in map {
                    let token = k.replace('~', "~0").replace('/', "~1");
                    walk(child, format!("{at}/{token}"), out);
                }
            }
            serde_json::Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    walk(child, format!("{at}/{i}"), out);
                }
            }
            scalar => {
                let ptr = if at.is_empty() { "/".to_string() } else { at };
                out.push((ptr, scalar));
            }
        }
    }

    let mut out = Vec::new();
    walk(v, String::new(), &mut out);
    out
}
