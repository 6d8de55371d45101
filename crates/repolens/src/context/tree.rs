//! Plain-text rendering of a project's file tree, in the style of `tree`.

use std::collections::BTreeMap;

#[derive(Default)]
struct Node {
    children: BTreeMap<String, Node>,
}

/// Render `paths` (slash-separated, repository-relative) under a
/// `project_name/` header. Entries are sorted at every level.
///
/// ```ignore
/// let text = render_tree("demo", ["src/main.rs", "Cargo.toml"]);
/// assert_eq!(text, "demo/\n├── Cargo.toml\n└── src\n    └── main.rs\n");
/// ```
pub fn render_tree<I, S>(project_name: &str, paths: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut root = Node::default();
    for path in paths {
        let mut node = &mut root;
        for part in path.as_ref().split('/').filter(|p| !p.is_empty()) {
            node = node.children.entry(part.to_string()).or_default();
        }
    }

    let mut out = format!("{project_name}/\n");
    render_children(&root, "", &mut out);
    out
}

fn render_children(node: &Node, indent: &str, out: &mut String) {
    let last = node.children.len().saturating_sub(1);
    for (i, (name, child)) in node.children.iter().enumerate() {
        let (connector, extension) = if i == last {
            ("└── ", "    ")
        } else {
            ("├── ", "│   ")
        };
        out.push_str(indent);
        out.push_str(connector);
        out.push_str(name);
        out.push('\n');
        if !child.children.is_empty() {
            render_children(child, &format!("{indent}{extension}"), out);
        }
    }
}
