//! Pointer-authentication shims.
//!
//! arm64e signs data and code pointers as they are written by the fixup
//! engine; every other architecture passes values through untouched.

/// Signing metadata carried by chained-fixup binds and cache patch
/// records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerMetaData {
    pub high8: u8,
    pub diversity: u16,
    pub has_auth: bool,
    pub key: u8,
    pub uses_addr_diversity: bool,
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_feature = "paca"))] {
        /// Signs `value` for storage at `loc` per the metadata.
        pub fn sign_pointer(value: u64, loc: usize, pmd: &PointerMetaData) -> u64 {
            if !pmd.has_auth {
                return value;
            }
            let discriminator = if pmd.uses_addr_diversity {
                blend_discriminator(loc, pmd.diversity)
            } else {
                u64::from(pmd.diversity)
            };
            // SAFETY: PAC instructions only compute a signature, the
            // pointer is not dereferenced
            unsafe { raw_sign(value, pmd.key, discriminator) }
        }

        fn blend_discriminator(loc: usize, diversity: u16) -> u64 {
            ((loc as u64) & 0x0000_ffff_ffff_ffff) | (u64::from(diversity) << 48)
        }

        unsafe fn raw_sign(value: u64, key: u8, discriminator: u64) -> u64 {
            let mut v = value;
            unsafe {
                match key & 0x3 {
                    0 => core::arch::asm!("pacia {v}, {d}", v = inout(reg) v, d = in(reg) discriminator),
                    1 => core::arch::asm!("pacib {v}, {d}", v = inout(reg) v, d = in(reg) discriminator),
                    2 => core::arch::asm!("pacda {v}, {d}", v = inout(reg) v, d = in(reg) discriminator),
                    _ => core::arch::asm!("pacdb {v}, {d}", v = inout(reg) v, d = in(reg) discriminator),
                }
            }
            v
        }
    } else {
        /// Identity on architectures without pointer authentication.
        pub fn sign_pointer(value: u64, _loc: usize, _pmd: &PointerMetaData) -> u64 {
            value
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unauthenticated_value_passes_through() {
        let pmd = PointerMetaData::default();
        assert_eq!(sign_pointer(0x1_0000_1234, 0x7000, &pmd), 0x1_0000_1234);
    }
}
