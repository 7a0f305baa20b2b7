//! Introspection document type.
//!
//! Just enough of the document model to describe an object's interfaces
//! and children; the connection core uses it to synthesise virtual parent
//! nodes so every exported leaf is reachable by a walk from `/`.

use std::fmt::Write;

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \
                       \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// One node of the object tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// Interface names implemented by this node.
    pub interfaces: Vec<String>,
    /// Names of direct children, relative to this node.
    pub children: Vec<String>,
}

impl Node {
    /// A node listing only child names, as virtual parents do.
    pub fn with_children(children: Vec<String>) -> Self {
        Node {
            interfaces: vec![crate::INTROSPECTABLE_INTERFACE.to_string()],
            children,
        }
    }

    /// Render the document, DOCTYPE header included.
    pub fn to_xml(&self) -> String {
        let mut out = String::from(DOCTYPE);
        out.push_str("<node>\n");
        for interface in &self.interfaces {
            let _ = writeln!(out, " <interface name=\"{}\"/>", xml_escape(interface));
        }
        for child in &self.children {
            let _ = writeln!(out, " <node name=\"{}\"/>", xml_escape(child));
        }
        out.push_str("</node>\n");
        out
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_children_and_interfaces() {
        let node = Node::with_children(vec!["a".into(), "b".into()]);
        let xml = node.to_xml();
        assert!(xml.starts_with("<!DOCTYPE"));
        assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Introspectable\"/>"));
        assert!(xml.contains("<node name=\"a\"/>"));
        assert!(xml.contains("<node name=\"b\"/>"));
        assert!(xml.trim_end().ends_with("</node>"));
    }
}
