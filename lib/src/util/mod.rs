pub mod file;
pub mod table;

/// Creates a fixed-size array reference from a slice.
#[macro_export]
macro_rules! array_ref {
    ($slice:expr, $offset:expr, $size:expr) => {{
        #[inline]
        fn to_array<T>(slice: &[T]) -> &[T; $size] {
            unsafe { &*(slice.as_ptr() as *const [_; $size]) }
        }
        to_array(&$slice[$offset..$offset + $size])
    }};
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
pub fn align_up(value: u64, align: u64) -> u64 { (value + align - 1) & !(align - 1) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 4), 20);
        assert_eq!(align_up(5, 1), 5);
    }

    #[test]
    fn test_array_ref() {
        let data = [1u8, 2, 3, 4, 5, 6];
        assert_eq!(array_ref!(data, 2, 4), &[3, 4, 5, 6]);
    }
}
