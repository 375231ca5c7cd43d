//! Atomic operation datatypes

/// Element types an atomic operation can act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Datatype {
    Int8 = 0,
    UInt8 = 1,
    Int16 = 2,
    UInt16 = 3,
    Int32 = 4,
    UInt32 = 5,
    Int64 = 6,
    UInt64 = 7,
    Float = 8,
    Double = 9,
    FloatComplex = 10,
    DoubleComplex = 11,
}

impl Datatype {
    /// Size in bytes
    pub const fn size(&self) -> usize {
        match self {
            Datatype::Int8 | Datatype::UInt8 => 1,
            Datatype::Int16 | Datatype::UInt16 => 2,
            Datatype::Int32 | Datatype::UInt32 | Datatype::Float => 4,
            Datatype::Int64 | Datatype::UInt64 | Datatype::Double | Datatype::FloatComplex => 8,
            Datatype::DoubleComplex => 16,
        }
    }

    pub const fn is_integer(&self) -> bool {
        (*self as u8) < 8
    }

    pub const fn is_complex(&self) -> bool {
        matches!(self, Datatype::FloatComplex | Datatype::DoubleComplex)
    }

    /// Convert from u8
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Datatype::Int8),
            1 => Some(Datatype::UInt8),
            2 => Some(Datatype::Int16),
            3 => Some(Datatype::UInt16),
            4 => Some(Datatype::Int32),
            5 => Some(Datatype::UInt32),
            6 => Some(Datatype::Int64),
            7 => Some(Datatype::UInt64),
            8 => Some(Datatype::Float),
            9 => Some(Datatype::Double),
            10 => Some(Datatype::FloatComplex),
            11 => Some(Datatype::DoubleComplex),
            _ => None,
        }
    }
}
