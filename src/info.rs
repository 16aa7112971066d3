//! Info protocol: `;`-separated entries of `:`-separated `key=value` fields.

use crate::indexing::IndexState;
use crate::models::{IndexSpec, TaskStatus};
use crate::udf::ModuleInfo;

pub const COMMANDS: &[&str] = &["build", "namespaces", "sets", "sindex", "udf-list", "statistics"];

pub(crate) fn sindex_entry(spec: &IndexSpec, state: &IndexState) -> String {
    let state = match state {
        IndexState::Ready => "RW",
        IndexState::Building => "WO",
        IndexState::Failed(_) => "FAILED",
    };
    format!(
        "ns={}:set={}:indexname={}:bin={}:type={}:state={state}",
        spec.namespace, spec.set, spec.name, spec.bin, spec.index_type
    )
}

pub(crate) fn udf_entry(module: &ModuleInfo) -> String {
    let state = match &module.status {
        TaskStatus::InProgress => "compiling",
        TaskStatus::Complete => "ready",
        TaskStatus::Failed(_) => "failed",
    };
    format!(
        "filename={}:generation={}:state={state}",
        module.file_name, module.generation
    )
}

pub(crate) fn join(entries: impl IntoIterator<Item = String>) -> String {
    entries.into_iter().collect::<Vec<_>>().join(";")
}

/// Lay out an info response for a terminal: the title, then each entry's
/// fields on tab-indented lines, entries separated by a blank line.
pub fn render(title: &str, info: &str) -> String {
    let mut out = format!("{title}\n");
    for entry in info.split(';').filter(|e| !e.is_empty()) {
        for field in entry.split(':') {
            out.push('\t');
            out.push_str(field);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IndexType;

    #[test]
    fn test_sindex_entry_and_render() {
        let spec = IndexSpec::new("test", "profile", "profileindex", "username", IndexType::String);
        let entry = sindex_entry(&spec, &IndexState::Ready);
        assert_eq!(
            entry,
            "ns=test:set=profile:indexname=profileindex:bin=username:type=STRING:state=RW"
        );

        let text = render("indexes", &join([entry, "ns=x".to_string()]));
        assert!(text.starts_with("indexes\n\tns=test\n\tset=profile\n"));
        assert!(text.ends_with("\tns=x\n\n"));
    }
}
