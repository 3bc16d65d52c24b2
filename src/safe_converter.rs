pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<i64> for usize {
    fn prechecked_cast(self) -> i64 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_cast() {
        let x: usize = 17u32.safe_cast();
        assert_eq!(x, 17);
        let y: u64 = 18usize.safe_cast();
        assert_eq!(y, 18);
    }

    #[test]
    fn test_prechecked_cast() {
        let x: u32 = 5usize.prechecked_cast();
        assert_eq!(x, 5);
        let y: i64 = 6usize.prechecked_cast();
        assert_eq!(y, 6);
    }

    #[test]
    #[should_panic]
    #[cfg(target_pointer_width = "64")]
    fn test_prechecked_cast_out_of_range() {
        let _: u32 = (u32::MAX as usize + 1).prechecked_cast();
    }
}
