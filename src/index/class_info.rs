use crate::provider::FieldValue;
use std::collections::HashSet;

lazy_static! {
    static ref PRIMITIVE_NAMES: HashSet<&'static str> = [
        "boolean", "byte", "short", "char", "int", "long", "float", "double", "void",
    ]
    .into_iter()
    .collect();
}

pub fn is_primitive_name(name: &str) -> bool {
    PRIMITIVE_NAMES.contains(name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Object,
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl FieldType {
    pub fn from_signature(signature: &str) -> Option<FieldType> {
        Some(match signature.as_bytes().first()? {
            b'L' | b'[' => FieldType::Object,
            b'Z' => FieldType::Boolean,
            b'B' => FieldType::Byte,
            b'C' => FieldType::Char,
            b'S' => FieldType::Short,
            b'I' => FieldType::Int,
            b'J' => FieldType::Long,
            b'F' => FieldType::Float,
            b'D' => FieldType::Double,
            _ => return None,
        })
    }
}

/// Name and type of an instance field; describes the object layout only
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: Option<FieldType>,
}

/// A static field, or one of the pseudo fields a class carries: `<super>`,
/// `<field>` copies of its class object's fields and `<constant pool[n]>`.
#[derive(Clone, Debug, PartialEq)]
pub struct StaticField {
    pub name: String,
    pub field_type: Option<FieldType>,
    pub value: FieldValue,
}

impl StaticField {
    pub fn object(name: impl Into<String>, address: u64) -> Self {
        StaticField {
            name: name.into(),
            field_type: Some(FieldType::Object),
            value: FieldValue::Object(address),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClassInfo {
    /// Id of the class itself in the identifier table
    pub id: usize,
    pub address: u64,
    pub name: String,
    pub super_id: Option<usize>,
    /// 0 when the class has no superclass
    pub super_address: u64,
    pub loader_id: Option<usize>,
    pub loader_address: u64,
    /// Id and address of `java.lang.Class`, set once class sizes are known
    pub class_id: Option<usize>,
    pub class_address: u64,
    pub fields: Vec<FieldDescriptor>,
    pub statics: Vec<StaticField>,
    pub subclasses: Vec<usize>,
    pub instance_count: usize,
    pub total_size: i64,
    /// Size of the class object plus its methods
    pub used_heap_size: i64,
    /// -1 until an instance has been seen; per element size for arrays
    pub heap_size_per_instance: i64,
}

impl ClassInfo {
    pub fn new(id: usize, address: u64, name: String) -> Self {
        ClassInfo {
            id,
            address,
            name,
            super_id: None,
            super_address: 0,
            loader_id: None,
            loader_address: 0,
            class_id: None,
            class_address: 0,
            fields: vec![],
            statics: vec![],
            subclasses: vec![],
            instance_count: 0,
            total_size: 0,
            used_heap_size: 0,
            heap_size_per_instance: -1,
        }
    }

    pub fn add_instance(&mut self, size: i64) {
        self.instance_count += 1;
        self.total_size += size;
    }

    pub fn is_array_type(&self) -> bool {
        self.name.ends_with("[]")
    }

    /// Addresses this class refers to: its class, its loader and every
    /// object valued static or pseudo field
    pub fn references(&self) -> Vec<u64> {
        let mut refs = Vec::with_capacity(self.statics.len() + 2);
        if self.class_address != 0 {
            refs.push(self.class_address);
        }
        refs.push(self.loader_address);
        refs.extend(self.statics.iter().filter_map(|f| match f.value {
            FieldValue::Object(a) => Some(a),
            _ => None,
        }));
        refs
    }
}

/// Converts a runtime class name to the dotted form with `[]` suffixes,
/// e.g. `[[Ljava/lang/String;` becomes `java.lang.String[][]`
pub fn display_name(name: &str) -> String {
    let dotted = name.replace('/', ".");
    let dim = dotted.rfind('[').map_or(0, |i| i + 1);
    let base = &dotted[dim..];
    let mut out = if let Some(stripped) = base.strip_suffix(';') {
        stripped.strip_prefix('L').unwrap_or(stripped).to_string()
    } else if dim > 0 {
        match base {
            "Z" => "boolean".to_string(),
            "B" => "byte".to_string(),
            "S" => "short".to_string(),
            "C" => "char".to_string(),
            "I" => "int".to_string(),
            "F" => "float".to_string(),
            "J" => "long".to_string(),
            "D" => "double".to_string(),
            // some readers drop the trailing semicolon
            _ => base.strip_prefix('L').unwrap_or(base).to_string(),
        }
    } else {
        base.to_string()
    };
    for _ in 0..dim {
        out.push_str("[]");
    }
    out
}
