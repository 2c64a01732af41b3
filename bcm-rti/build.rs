use std::env;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use proc_macro2::{Literal, TokenStream};
use quote::format_ident;
use quote::quote;

mod build_serde;
use build_serde::{ConfigWrite, Register, RegisterFile};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Retrieve the enabled chip feature
    let chip_name = match env::vars()
        .map(|(a, _)| a)
        .filter(|x| x.starts_with("CARGO_FEATURE_BCM"))
        .get_one()
    {
        Ok(x) => x,
        Err(GetOneError::None) => panic!("No bcmxxxx Cargo feature enabled"),
        Err(GetOneError::Multiple) => panic!("Multiple bcmxxxx Cargo features enabled"),
    }
    .strip_prefix("CARGO_FEATURE_")
    .ok_or("chip feature without CARGO_FEATURE_ prefix")?
    .to_ascii_lowercase();

    println!("cargo:rerun-if-changed=data/{}", chip_name);
    println!("cargo:rerun-if-changed=build_serde.rs");
    let data_dir = Path::new("data").join(&chip_name);

    // Read and parse registers.yaml
    let registers_path = data_dir.join("registers.yaml");
    let registers_content = fs::read_to_string(&registers_path)
        .map_err(|e| format!("Failed to read {}: {}", registers_path.display(), e))?;
    let registers: RegisterFile = serde_yaml::from_str(&registers_content)
        .map_err(|e| format!("Failed to parse registers.yaml: {}", e))?;

    check_offsets(&registers)?;

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let dest_path = out_dir.join("_generated.rs");

    let mut token_stream = TokenStream::new();

    let chip = Literal::string(&chip_name);
    token_stream.extend(quote! {
        /// Chip this register table was generated for.
        pub const CHIP: &str = #chip;
    });

    token_stream.extend(generate_bar_mod("bar0", quote!(Bar::Bar0), &registers.bar0));
    token_stream.extend(generate_bar_mod("bar1", quote!(Bar::Bar1), &registers.bar1));
    token_stream.extend(generate_config_mod(&registers.config));
    token_stream.extend(generate_all_table(&registers));

    let mut file = File::create(&dest_path)?;
    write!(file, "{}", token_stream)?;
    rustfmt(&dest_path);

    Ok(())
}

fn check_offsets(registers: &RegisterFile) -> Result<(), String> {
    for (bar, regs) in [("bar0", &registers.bar0), ("bar1", &registers.bar1)] {
        for (name, reg) in regs {
            if reg.offset % 4 != 0 {
                return Err(format!("{}/{}: offset 0x{:x} is not 32-bit aligned", bar, name, reg.offset));
            }
            if reg.offset > u32::MAX as u64 {
                return Err(format!("{}/{}: offset 0x{:x} out of range", bar, name, reg.offset));
            }
            if let Some((other, _)) = regs.iter().find(|(n, r)| n != name && r.offset == reg.offset) {
                return Err(format!("{}/{} and {}/{} share offset 0x{:x}", bar, name, bar, other, reg.offset));
            }
        }
    }
    for (name, write) in &registers.config {
        if write.offset > 0xfff || write.offset % 4 != 0 {
            return Err(format!("config/{}: bad config offset 0x{:x}", name, write.offset));
        }
        if write.value > u32::MAX as u64 {
            return Err(format!("config/{}: value 0x{:x} is wider than 32 bits", name, write.value));
        }
    }
    Ok(())
}

fn generate_bar_mod(mod_name: &str, bar: TokenStream, regs: &[(String, Register)]) -> TokenStream {
    let mod_ident = format_ident!("{}", mod_name);
    let consts = regs.iter().map(|(name, reg)| {
        let ident = format_ident!("{}", name);
        let offset = Literal::u32_unsuffixed(reg.offset as u32);
        let doc = reg
            .description
            .clone()
            .unwrap_or_else(|| format!("Vendor register at {} offset 0x{:x}.", mod_name, reg.offset));
        quote! {
            #[doc = #doc]
            pub const #ident: Reg = Reg::new(#bar, #offset);
        }
    });

    quote! {
        #[allow(missing_docs)]
        pub mod #mod_ident {
            use super::{Bar, Reg};
            #(#consts)*
        }
    }
}

fn generate_config_mod(writes: &[(String, ConfigWrite)]) -> TokenStream {
    let entries = writes.iter().map(|(name, write)| {
        let name = Literal::string(name);
        let offset = Literal::u16_unsuffixed(write.offset as u16);
        let value = Literal::u32_unsuffixed(write.value as u32);
        quote! { ConfigWrite { name: #name, offset: #offset, value: #value }, }
    });

    quote! {
        pub mod config {
            use super::ConfigWrite;

            /// Config-space address window writes, in the order they must be applied.
            pub const ADDRESS_WINDOWS: &[ConfigWrite] = &[#(#entries)*];
        }
    }
}

fn generate_all_table(registers: &RegisterFile) -> TokenStream {
    let bar0 = registers.bar0.iter().map(|(name, _)| {
        let ident = format_ident!("{}", name);
        let label = Literal::string(&format!("bar0/{}", name));
        quote! { (#label, bar0::#ident), }
    });
    let bar1 = registers.bar1.iter().map(|(name, _)| {
        let ident = format_ident!("{}", name);
        let label = Literal::string(&format!("bar1/{}", name));
        quote! { (#label, bar1::#ident), }
    });

    quote! {
        /// Every named MMIO register, labelled `barN/NAME`.
        pub const ALL: &[(&str, Reg)] = &[#(#bar0)* #(#bar1)*];
    }
}

enum GetOneError {
    None,
    Multiple,
}

trait IteratorExt: Iterator {
    fn get_one(self) -> Result<Self::Item, GetOneError>;
}

impl<T: Iterator> IteratorExt for T {
    fn get_one(mut self) -> Result<Self::Item, GetOneError> {
        match self.next() {
            None => Err(GetOneError::None),
            Some(res) => match self.next() {
                Some(_) => Err(GetOneError::Multiple),
                None => Ok(res),
            },
        }
    }
}

fn rustfmt(path: impl AsRef<Path>) {
    let path = path.as_ref();
    match Command::new("rustfmt").args([path]).output() {
        Err(e) => {
            eprintln!("failed to exec rustfmt {:?}: {:?}", path, e);
        }
        Ok(out) => {
            if !out.status.success() {
                eprintln!("rustfmt {:?} failed:", path);
                eprintln!("=== STDOUT:");
                let _ = std::io::stderr().write_all(&out.stdout);
                eprintln!("=== STDERR:");
                let _ = std::io::stderr().write_all(&out.stderr);
            }
        }
    }
}
