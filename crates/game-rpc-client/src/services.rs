//! Method table built from the `KRPC.GetServices` introspection result

use crate::rpc::Signature;
use game_rpc_core::schema;
use game_rpc_core::{GameRpcError, ProcedureKind, Result, TypeStore};
use serde::Serialize;
use std::collections::BTreeMap;

/// A callable procedure and its resolved types
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcedureEntry {
    pub service: String,
    pub name: String,
    pub kind: ProcedureKind,
    pub signature: Signature,
    /// Per parameter: whether the server has a default for it
    pub has_default: Vec<bool>,
    pub documentation: String,
}

impl ProcedureEntry {
    /// Number of parameters the caller must supply
    pub fn required_arguments(&self) -> usize {
        self.has_default.iter().filter(|d| !**d).count()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClassEntry {
    pub name: String,
    pub documentation: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnumerationValueEntry {
    pub name: String,
    pub value: i32,
    pub documentation: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnumerationEntry {
    pub name: String,
    pub values: Vec<EnumerationValueEntry>,
    pub documentation: String,
}

impl EnumerationEntry {
    pub fn value(&self, name: &str) -> Option<i32> {
        self.values.iter().find(|v| v.name == name).map(|v| v.value)
    }

    pub fn name_of(&self, value: i32) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.value == value)
            .map(|v| v.name.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    pub name: String,
    pub documentation: String,
    pub procedures: BTreeMap<String, ProcedureEntry>,
    pub classes: BTreeMap<String, ClassEntry>,
    pub enumerations: BTreeMap<String, EnumerationEntry>,
}

/// Every service the server offers, keyed by name
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceTable {
    services: BTreeMap<String, ServiceEntry>,
}

impl ServiceTable {
    /// Resolve every procedure signature and intern class and
    /// enumeration types
    pub fn build(services: &schema::Services, types: &TypeStore) -> Result<Self> {
        let mut table = BTreeMap::new();
        for service in &services.services {
            let classes = service
                .classes
                .iter()
                .map(|class| {
                    types.as_type(&format!("Class({}.{})", service.name, class.name))?;
                    Ok((
                        class.name.clone(),
                        ClassEntry {
                            name: class.name.clone(),
                            documentation: class.documentation.clone(),
                        },
                    ))
                })
                .collect::<Result<BTreeMap<_, _>>>()?;

            let enumerations = service
                .enumerations
                .iter()
                .map(|e| {
                    types.as_type(&format!("{}.{}", service.name, e.name))?;
                    Ok((e.name.clone(), enumeration_entry(e)))
                })
                .collect::<Result<BTreeMap<_, _>>>()?;

            let procedures = service
                .procedures
                .iter()
                .map(|p| Ok((p.name.clone(), procedure_entry(&service.name, p, types)?)))
                .collect::<Result<BTreeMap<_, _>>>()?;

            table.insert(
                service.name.clone(),
                ServiceEntry {
                    name: service.name.clone(),
                    documentation: service.documentation.clone(),
                    procedures,
                    classes,
                    enumerations,
                },
            );
        }
        Ok(Self { services: table })
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.services.values()
    }

    pub fn service(&self, name: &str) -> Result<&ServiceEntry> {
        self.services
            .get(name)
            .ok_or_else(|| GameRpcError::NotFound(format!("Service {}", name)))
    }

    pub fn procedure(&self, service: &str, name: &str) -> Result<&ProcedureEntry> {
        self.service(service)?
            .procedures
            .get(name)
            .ok_or_else(|| GameRpcError::NotFound(format!("Procedure {}.{}", service, name)))
    }

    pub fn property_getter(&self, service: &str, property: &str) -> Result<&ProcedureEntry> {
        self.find(service, &format!("property getter {}", property), |kind| {
            matches!(kind, ProcedureKind::PropertyGetter { property: p } if p == property)
        })
    }

    pub fn property_setter(&self, service: &str, property: &str) -> Result<&ProcedureEntry> {
        self.find(service, &format!("property setter {}", property), |kind| {
            matches!(kind, ProcedureKind::PropertySetter { property: p } if p == property)
        })
    }

    pub fn class_method(&self, service: &str, class: &str, method: &str) -> Result<&ProcedureEntry> {
        self.find(service, &format!("method {}.{}", class, method), |kind| {
            matches!(kind, ProcedureKind::ClassMethod { class: c, method: m } if c == class && m == method)
        })
    }

    pub fn static_method(&self, service: &str, class: &str, method: &str) -> Result<&ProcedureEntry> {
        self.find(service, &format!("static method {}.{}", class, method), |kind| {
            matches!(kind, ProcedureKind::StaticMethod { class: c, method: m } if c == class && m == method)
        })
    }

    pub fn class_property_getter(
        &self,
        service: &str,
        class: &str,
        property: &str,
    ) -> Result<&ProcedureEntry> {
        self.find(service, &format!("property getter {}.{}", class, property), |kind| {
            matches!(kind, ProcedureKind::ClassPropertyGetter { class: c, property: p } if c == class && p == property)
        })
    }

    pub fn class_property_setter(
        &self,
        service: &str,
        class: &str,
        property: &str,
    ) -> Result<&ProcedureEntry> {
        self.find(service, &format!("property setter {}.{}", class, property), |kind| {
            matches!(kind, ProcedureKind::ClassPropertySetter { class: c, property: p } if c == class && p == property)
        })
    }

    pub fn enumeration(&self, service: &str, name: &str) -> Result<&EnumerationEntry> {
        self.service(service)?
            .enumerations
            .get(name)
            .ok_or_else(|| GameRpcError::NotFound(format!("Enumeration {}.{}", service, name)))
    }

    fn find(
        &self,
        service: &str,
        what: &str,
        predicate: impl Fn(&ProcedureKind) -> bool,
    ) -> Result<&ProcedureEntry> {
        self.service(service)?
            .procedures
            .values()
            .find(|p| predicate(&p.kind))
            .ok_or_else(|| GameRpcError::NotFound(format!("{} has no {}", service, what)))
    }
}

fn procedure_entry(
    service: &str,
    procedure: &schema::Procedure,
    types: &TypeStore,
) -> Result<ProcedureEntry> {
    let attributes = procedure.attributes.as_slice();
    let param_types = procedure
        .parameters
        .iter()
        .enumerate()
        .map(|(position, p)| types.get_parameter_type(position, &p.r#type, attributes))
        .collect::<Result<Vec<_>>>()?;
    let return_type = procedure
        .return_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(|t| types.get_return_type(t, attributes))
        .transpose()?;

    Ok(ProcedureEntry {
        service: service.to_string(),
        name: procedure.name.clone(),
        kind: ProcedureKind::from_attributes(attributes),
        signature: Signature {
            param_names: procedure.parameters.iter().map(|p| p.name.clone()).collect(),
            param_types,
            return_type,
        },
        has_default: procedure
            .parameters
            .iter()
            .map(|p| p.default_argument.is_some())
            .collect(),
        documentation: procedure.documentation.clone(),
    })
}

fn enumeration_entry(enumeration: &schema::Enumeration) -> EnumerationEntry {
    EnumerationEntry {
        name: enumeration.name.clone(),
        values: enumeration
            .values
            .iter()
            .map(|v| EnumerationValueEntry {
                name: v.name.clone(),
                value: v.value,
                documentation: v.documentation.clone(),
            })
            .collect(),
        documentation: enumeration.documentation.clone(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use game_rpc_core::TypeDescriptor;
    use std::sync::Arc;

    fn parameter(name: &str, ty: &str) -> schema::Parameter {
        schema::Parameter {
            name: name.into(),
            r#type: ty.into(),
            default_argument: None,
        }
    }

    fn procedure(
        name: &str,
        parameters: Vec<schema::Parameter>,
        return_type: Option<&str>,
        attributes: &[&str],
    ) -> schema::Procedure {
        schema::Procedure {
            name: name.into(),
            parameters,
            return_type: return_type.map(Into::into),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            documentation: String::new(),
        }
    }

    /// A small `TestService` used across the client tests
    pub(crate) fn test_services() -> schema::Services {
        let mut optional = parameter("y", "int32");
        optional.default_argument = Some(vec![0x2a]);
        schema::Services {
            services: vec![schema::Service {
                name: "TestService".into(),
                procedures: vec![
                    procedure(
                        "FloatToString",
                        vec![parameter("value", "float")],
                        Some("string"),
                        &[],
                    ),
                    procedure("Echo", vec![parameter("value", "string")], Some("string"), &[]),
                    procedure("AddWithDefault", vec![parameter("x", "int32"), optional], Some("int32"), &[]),
                    procedure("get_Counter", vec![], Some("int32"), &["Property.Get(Counter)"]),
                    procedure("CounterReached", vec![parameter("value", "int32")], Some("KRPC.Event"), &[]),
                    procedure(
                        "set_Counter",
                        vec![parameter("value", "int32")],
                        None,
                        &["Property.Set(Counter)"],
                    ),
                    procedure(
                        "TestClass_GetValue",
                        vec![parameter("this", "uint64")],
                        Some("string"),
                        &[
                            "Class.Method(TestService.TestClass,GetValue)",
                            "ParameterType(0).Class(TestService.TestClass)",
                        ],
                    ),
                    procedure(
                        "TestClass_static_Create",
                        vec![parameter("value", "string")],
                        Some("uint64"),
                        &[
                            "Class.StaticMethod(TestService.TestClass,Create)",
                            "ReturnType.Class(TestService.TestClass)",
                        ],
                    ),
                    procedure(
                        "TestClass_get_IntProperty",
                        vec![parameter("this", "uint64")],
                        Some("int32"),
                        &[
                            "Class.Property.Get(TestService.TestClass,IntProperty)",
                            "ParameterType(0).Class(TestService.TestClass)",
                        ],
                    ),
                    procedure(
                        "TestClass_set_IntProperty",
                        vec![parameter("this", "uint64"), parameter("value", "int32")],
                        None,
                        &[
                            "Class.Property.Set(TestService.TestClass,IntProperty)",
                            "ParameterType(0).Class(TestService.TestClass)",
                        ],
                    ),
                ],
                classes: vec![schema::Class {
                    name: "TestClass".into(),
                    documentation: String::new(),
                }],
                enumerations: vec![schema::Enumeration {
                    name: "TestEnum".into(),
                    values: vec![
                        schema::EnumerationValue {
                            name: "ValueA".into(),
                            value: 0,
                            documentation: String::new(),
                        },
                        schema::EnumerationValue {
                            name: "ValueB".into(),
                            value: 1,
                            documentation: String::new(),
                        },
                    ],
                    documentation: String::new(),
                }],
                documentation: "Service used by the tests".into(),
            }],
        }
    }

    #[test]
    fn test_build_interns_classes_and_enumerations() {
        let types = TypeStore::new();
        let before = types.as_type("Class(TestService.TestClass)").unwrap();
        let table = ServiceTable::build(&test_services(), &types).unwrap();

        let method = table.class_method("TestService", "TestClass", "GetValue").unwrap();
        assert!(Arc::ptr_eq(&method.signature.param_types[0], &before));
        assert_eq!(
            *types.as_type("TestService.TestEnum").unwrap(),
            TypeDescriptor::Enumeration("TestService.TestEnum".into())
        );

        let e = table.enumeration("TestService", "TestEnum").unwrap();
        assert_eq!(e.value("ValueB"), Some(1));
        assert_eq!(e.name_of(0), Some("ValueA"));
    }

    #[test]
    fn test_lookups_by_kind() {
        let types = TypeStore::new();
        let table = ServiceTable::build(&test_services(), &types).unwrap();

        assert_eq!(table.property_getter("TestService", "Counter").unwrap().name, "get_Counter");
        assert_eq!(table.property_setter("TestService", "Counter").unwrap().name, "set_Counter");
        let create = table.static_method("TestService", "TestClass", "Create").unwrap();
        assert_eq!(
            create.signature.return_type.as_deref().map(ToString::to_string).as_deref(),
            Some("Class(TestService.TestClass)")
        );
        assert!(table
            .class_property_setter("TestService", "TestClass", "IntProperty")
            .unwrap()
            .kind
            .is_setter());
        assert!(table
            .class_property_getter("TestService", "TestClass", "IntProperty")
            .is_ok());
    }

    #[test]
    fn test_defaults_and_void_returns() {
        let types = TypeStore::new();
        let table = ServiceTable::build(&test_services(), &types).unwrap();

        let add = table.procedure("TestService", "AddWithDefault").unwrap();
        assert_eq!(add.has_default, vec![false, true]);
        assert_eq!(add.required_arguments(), 1);

        let setter = table.procedure("TestService", "set_Counter").unwrap();
        assert!(setter.signature.return_type.is_none());
    }

    #[test]
    fn test_unknown_names() {
        let types = TypeStore::new();
        let table = ServiceTable::build(&test_services(), &types).unwrap();
        assert!(matches!(table.service("Nope"), Err(GameRpcError::NotFound(_))));
        assert!(matches!(
            table.procedure("TestService", "Nope"),
            Err(GameRpcError::NotFound(_))
        ));
        assert!(table.property_getter("TestService", "Nope").is_err());
        assert!(table.class_method("TestService", "TestClass", "Nope").is_err());
    }

    #[test]
    fn test_serializes_to_json() {
        let types = TypeStore::new();
        let table = ServiceTable::build(&test_services(), &types).unwrap();
        let json = serde_json::to_value(&table).unwrap();
        let echo = &json["Services"]["TestService"]["Procedures"]["Echo"];
        assert_eq!(echo["Kind"]["Kind"], "Procedure");
        assert_eq!(echo["Signature"]["ParamTypes"][0], "string");
        let getter = &json["Services"]["TestService"]["Procedures"]["get_Counter"];
        assert_eq!(getter["Kind"]["Property"], "Counter");
    }
}
