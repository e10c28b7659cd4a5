//! Procedure attribute tags from the service metadata
//!
//! The server tags each procedure with strings such as
//! `Property.Get(Name)` or `Class.Method(Service.Class,Method)` that say
//! how the procedure maps onto services, classes and properties, and
//! with `ParameterType(n).<type>` / `ReturnType.<type>` tags that refine
//! nominal wire types.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static PROPERTY_GET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Property\.Get\(([^,\)]+)\)$").expect("valid regex"));
static PROPERTY_SET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Property\.Set\(([^,\)]+)\)$").expect("valid regex"));
static CLASS_METHOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Class\.Method\(([^,\.\)]+)\.([^,\.\)]+),([^,\)]+)\)$").expect("valid regex")
});
static CLASS_STATIC_METHOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Class\.StaticMethod\(([^,\.\)]+)\.([^,\.\)]+),([^,\)]+)\)$")
        .expect("valid regex")
});
static CLASS_PROPERTY_GET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Class\.Property\.Get\(([^,\.\)]+)\.([^,\.\)]+),([^,\)]+)\)$")
        .expect("valid regex")
});
static CLASS_PROPERTY_SET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Class\.Property\.Set\(([^,\.\)]+)\.([^,\.\)]+),([^,\)]+)\)$")
        .expect("valid regex")
});
static PARAMETER_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ParameterType\((\d+)\)\.(.+)$").expect("valid regex"));
static RETURN_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ReturnType\.(.+)$").expect("valid regex"));

/// How a procedure is exposed on the client surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "Kind", rename_all = "PascalCase", rename_all_fields = "PascalCase")]
pub enum ProcedureKind {
    /// Plain service procedure
    Procedure,
    PropertyGetter {
        property: String,
    },
    PropertySetter {
        property: String,
    },
    /// Method on a class instance; parameter 0 is the instance
    ClassMethod {
        class: String,
        method: String,
    },
    StaticMethod {
        class: String,
        method: String,
    },
    ClassPropertyGetter {
        class: String,
        property: String,
    },
    ClassPropertySetter {
        class: String,
        property: String,
    },
}

impl ProcedureKind {
    /// Classify a procedure from its attribute list
    pub fn from_attributes<S: AsRef<str>>(attributes: &[S]) -> Self {
        for attr in attributes.iter().map(AsRef::as_ref) {
            if let Some(c) = PROPERTY_GET.captures(attr) {
                return ProcedureKind::PropertyGetter {
                    property: c[1].to_string(),
                };
            }
            if let Some(c) = PROPERTY_SET.captures(attr) {
                return ProcedureKind::PropertySetter {
                    property: c[1].to_string(),
                };
            }
            if let Some(c) = CLASS_METHOD.captures(attr) {
                return ProcedureKind::ClassMethod {
                    class: c[2].to_string(),
                    method: c[3].to_string(),
                };
            }
            if let Some(c) = CLASS_STATIC_METHOD.captures(attr) {
                return ProcedureKind::StaticMethod {
                    class: c[2].to_string(),
                    method: c[3].to_string(),
                };
            }
            if let Some(c) = CLASS_PROPERTY_GET.captures(attr) {
                return ProcedureKind::ClassPropertyGetter {
                    class: c[2].to_string(),
                    property: c[3].to_string(),
                };
            }
            if let Some(c) = CLASS_PROPERTY_SET.captures(attr) {
                return ProcedureKind::ClassPropertySetter {
                    class: c[2].to_string(),
                    property: c[3].to_string(),
                };
            }
        }
        ProcedureKind::Procedure
    }

    /// Class the procedure belongs to, if any
    pub fn class_name(&self) -> Option<&str> {
        match self {
            ProcedureKind::ClassMethod { class, .. }
            | ProcedureKind::StaticMethod { class, .. }
            | ProcedureKind::ClassPropertyGetter { class, .. }
            | ProcedureKind::ClassPropertySetter { class, .. } => Some(class),
            _ => None,
        }
    }

    pub fn is_setter(&self) -> bool {
        matches!(
            self,
            ProcedureKind::PropertySetter { .. } | ProcedureKind::ClassPropertySetter { .. }
        )
    }
}

/// Type strings that refine parameter `position`, in attribute order
pub fn parameter_type_attrs<S: AsRef<str>>(position: usize, attributes: &[S]) -> Vec<&str> {
    attributes
        .iter()
        .filter_map(|attr| {
            let attr = attr.as_ref();
            let c = PARAMETER_TYPE.captures(attr)?;
            let pos: usize = c[1].parse().ok()?;
            (pos == position).then(|| c.get(2).map(|m| m.as_str()))?
        })
        .collect()
}

/// Type strings that refine the return type, in attribute order
pub fn return_type_attrs<S: AsRef<str>>(attributes: &[S]) -> Vec<&str> {
    attributes
        .iter()
        .filter_map(|attr| {
            RETURN_TYPE
                .captures(attr.as_ref())
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_procedure() {
        let attrs: [&str; 0] = [];
        assert_eq!(ProcedureKind::from_attributes(&attrs), ProcedureKind::Procedure);
    }

    #[test]
    fn test_property_accessors() {
        assert_eq!(
            ProcedureKind::from_attributes(&["Property.Get(ActiveVessel)"]),
            ProcedureKind::PropertyGetter {
                property: "ActiveVessel".into()
            }
        );
        let setter = ProcedureKind::from_attributes(&["Property.Set(ActiveVessel)"]);
        assert!(setter.is_setter());
        assert_eq!(setter.class_name(), None);
    }

    #[test]
    fn test_class_members() {
        let attrs = [
            "Class.Method(SpaceCenter.Vessel,Flight)",
            "ParameterType(0).Class(SpaceCenter.Vessel)",
        ];
        let kind = ProcedureKind::from_attributes(&attrs);
        assert_eq!(
            kind,
            ProcedureKind::ClassMethod {
                class: "Vessel".into(),
                method: "Flight".into()
            }
        );
        assert_eq!(kind.class_name(), Some("Vessel"));

        assert_eq!(
            ProcedureKind::from_attributes(&["Class.StaticMethod(TestService.TestClass,Create)"]),
            ProcedureKind::StaticMethod {
                class: "TestClass".into(),
                method: "Create".into()
            }
        );
        assert!(
            ProcedureKind::from_attributes(&["Class.Property.Set(TestService.TestClass,IntProperty)"])
                .is_setter()
        );
    }

    #[test]
    fn test_type_refinements() {
        let attrs = [
            "Class.Property.Get(SpaceCenter.Vessel,Name)",
            "ParameterType(0).Class(SpaceCenter.Vessel)",
            "ParameterType(2).Class(SpaceCenter.Part)",
            "ReturnType.Class(SpaceCenter.Orbit)",
        ];
        assert_eq!(parameter_type_attrs(0, &attrs), vec!["Class(SpaceCenter.Vessel)"]);
        assert!(parameter_type_attrs(1, &attrs).is_empty());
        assert_eq!(parameter_type_attrs(2, &attrs), vec!["Class(SpaceCenter.Part)"]);
        assert_eq!(return_type_attrs(&attrs), vec!["Class(SpaceCenter.Orbit)"]);
    }
}
