//! Intrinsic method recognition.
//!
//! A small table mapping (holder, name, descriptor) to an [`IntrinsicId`].
//! Recognized invokes are replaced by an `Intrinsic` node during graph
//! building; lowering decides per id between a machine instruction and a
//! runtime call.

use crate::hir::IntrinsicId;

/// Recognize an invoke target as an intrinsic.
pub fn recognize(holder: &str, name: &str, descriptor: &str) -> Option<IntrinsicId> {
    let id = match (holder, name, descriptor) {
        ("java/lang/Math", "sin", "(D)D") => IntrinsicId::MathSin,
        ("java/lang/Math", "cos", "(D)D") => IntrinsicId::MathCos,
        ("java/lang/Math", "tan", "(D)D") => IntrinsicId::MathTan,
        ("java/lang/Math", "log", "(D)D") => IntrinsicId::MathLog,
        ("java/lang/Math", "log10", "(D)D") => IntrinsicId::MathLog10,
        ("java/lang/Math", "abs", "(D)D") => IntrinsicId::MathAbs,
        ("java/lang/Math", "sqrt", "(D)D") => IntrinsicId::MathSqrt,
        ("java/lang/Float", "floatToRawIntBits", "(F)I") => IntrinsicId::FloatToRawIntBits,
        ("java/lang/Float", "intBitsToFloat", "(I)F") => IntrinsicId::IntBitsToFloat,
        ("java/lang/Double", "doubleToRawLongBits", "(D)J") => IntrinsicId::DoubleToRawLongBits,
        ("java/lang/Double", "longBitsToDouble", "(J)D") => IntrinsicId::LongBitsToDouble,
        ("java/lang/System", "nanoTime", "()J") => IntrinsicId::NanoTime,
        ("java/lang/System", "currentTimeMillis", "()J") => IntrinsicId::CurrentTimeMillis,
        ("java/lang/Object", "<init>", "()V") => IntrinsicId::ObjectInit,
        ("sun/misc/Unsafe", "compareAndSwapInt", "(Ljava/lang/Object;JII)Z") => {
            IntrinsicId::CompareAndSwapInt
        }
        ("sun/misc/Unsafe", "compareAndSwapLong", "(Ljava/lang/Object;JJJ)Z") => {
            IntrinsicId::CompareAndSwapLong
        }
        (
            "sun/misc/Unsafe",
            "compareAndSwapObject",
            "(Ljava/lang/Object;JLjava/lang/Object;Ljava/lang/Object;)Z",
        ) => IntrinsicId::CompareAndSwapObject,
        _ => return None,
    };
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_math_intrinsics() {
        assert_eq!(
            recognize("java/lang/Math", "sin", "(D)D"),
            Some(IntrinsicId::MathSin)
        );
        assert_eq!(
            recognize("java/lang/Math", "sqrt", "(D)D"),
            Some(IntrinsicId::MathSqrt)
        );
        // Wrong descriptor is not an intrinsic.
        assert_eq!(recognize("java/lang/Math", "sin", "(F)F"), None);
    }

    #[test]
    fn test_bit_conversions() {
        assert_eq!(
            recognize("java/lang/Float", "floatToRawIntBits", "(F)I"),
            Some(IntrinsicId::FloatToRawIntBits)
        );
        assert_eq!(
            recognize("java/lang/Double", "longBitsToDouble", "(J)D"),
            Some(IntrinsicId::LongBitsToDouble)
        );
    }

    #[test]
    fn test_cas_and_object_init() {
        assert_eq!(
            recognize("sun/misc/Unsafe", "compareAndSwapInt", "(Ljava/lang/Object;JII)Z"),
            Some(IntrinsicId::CompareAndSwapInt)
        );
        assert_eq!(
            recognize("java/lang/Object", "<init>", "()V"),
            Some(IntrinsicId::ObjectInit)
        );
        assert_eq!(recognize("java/lang/Object", "hashCode", "()I"), None);
    }
}
