use crate::kernel_abi::SupportedArch;

/// Format of the extended register data. Only XSAVE-family layouts are
/// carried; on CPUs without XSAVE the data is the FPX (x86) or FP
/// (x86-64) area, which is layout-compatible with the legacy region of an
/// XSAVE area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Format {
    None,
    XSave,
}

/// The extended register bank: x87/SSE/AVX state as saved by XSAVE, or
/// the legacy fp regs on old kernels/CPUs. Kept as raw bytes; the tracer
/// never interprets the contents, it only transports them.
#[derive(Clone, Debug)]
pub struct ExtraRegisters {
    format: Format,
    arch: SupportedArch,
    data: Vec<u8>,
}

impl ExtraRegisters {
    pub fn new(arch: SupportedArch) -> ExtraRegisters {
        ExtraRegisters {
            format: Format::None,
            arch,
            data: Vec::new(),
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch
    }

    pub fn set_arch(&mut self, arch: SupportedArch) {
        self.arch = arch;
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn set_to_raw_data(&mut self, format: Format, data: Vec<u8>) {
        self.format = format;
        self.data = data;
    }

    /// Forget the contents, e.g. across an exec where the kernel resets
    /// the extended state.
    pub fn reset(&mut self) {
        self.format = Format::None;
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let e = ExtraRegisters::new(SupportedArch::X64);
        assert!(e.is_empty());
        assert_eq!(Format::None, e.format());
    }

    #[test]
    fn reset_clears() {
        let mut e = ExtraRegisters::new(SupportedArch::X64);
        e.set_to_raw_data(Format::XSave, vec![0u8; 512]);
        assert!(!e.is_empty());
        e.reset();
        assert!(e.is_empty());
        assert_eq!(Format::None, e.format());
    }
}
