// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-facto symbol resolution. Maps a raw instruction pointer, under a
//! given segment generation's image table, to (symbol, file, line) using
//! the ELF/DWARF data of the image that contains it. Never on the capture
//! hot path; the capture carries raw addresses only, which is also why
//! symbolic reports must be generated on the originating host.

use memtrail_format::ImageSegments;
use rustc_hash::FxHashMap;
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

/// A fully resolved native frame. Unresolved frames render as
/// `<unknown>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNativeFrame {
    pub ip: u64,
    pub symbol: String,
    pub file: String,
    pub line: u32,
}

impl ResolvedNativeFrame {
    fn unknown(ip: u64) -> Self {
        ResolvedNativeFrame {
            ip,
            symbol: "<unknown>".to_string(),
            file: String::new(),
            line: 0,
        }
    }
}

pub struct SymbolResolver {
    #[cfg(unix)]
    symbolizer: blazesym::symbolize::Symbolizer,
    /// Keyed by (ip, segment generation): the same ip may live in
    /// different images once `dlopen` moved the segment tables.
    cache: FxHashMap<(u64, u32), ResolvedNativeFrame>,
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolResolver {
    pub fn new() -> Self {
        SymbolResolver {
            #[cfg(unix)]
            symbolizer: blazesym::symbolize::Symbolizer::new(),
            cache: FxHashMap::default(),
        }
    }

    /// Resolves `ip` against `images` (the image table of segment
    /// generation `generation`). Deterministic for a given image on a
    /// given machine; results are cached per (ip, generation).
    pub fn resolve(
        &mut self,
        ip: u64,
        generation: u32,
        images: &[ImageSegments],
    ) -> ResolvedNativeFrame {
        if let Some(cached) = self.cache.get(&(ip, generation)) {
            return cached.clone();
        }
        let resolved = self
            .resolve_uncached(ip, images)
            .unwrap_or_else(|| ResolvedNativeFrame::unknown(ip));
        self.cache.insert((ip, generation), resolved.clone());
        resolved
    }

    #[cfg(unix)]
    fn resolve_uncached(&self, ip: u64, images: &[ImageSegments]) -> Option<ResolvedNativeFrame> {
        let image = images.iter().find(|image| image.contains(ip))?;
        if image.path.is_empty() {
            return None;
        }
        let elf = blazesym::symbolize::source::Elf::new(&*image.path);
        let src = blazesym::symbolize::source::Source::Elf(elf);
        let input = blazesym::symbolize::Input::VirtOffset(ip.checked_sub(image.base)?);
        let symbolized = match self.symbolizer.symbolize_single(&src, input) {
            Ok(symbolized) => symbolized,
            Err(error) => {
                tracing::debug!(%error, ip, "symbolization failed");
                return None;
            }
        };
        match symbolized {
            blazesym::symbolize::Symbolized::Sym(sym) => {
                let mut frame = ResolvedNativeFrame {
                    ip,
                    symbol: sym.name.into_owned(),
                    file: String::new(),
                    line: 0,
                };
                if let Some(code_info) = sym.code_info {
                    frame.file = code_info.to_path().display().to_string();
                    frame.line = code_info.line.unwrap_or(0);
                }
                frame.symbol = demangle(&frame.symbol);
                Some(frame)
            }
            blazesym::symbolize::Symbolized::Unknown(_) => None,
        }
    }

    #[cfg(not(unix))]
    fn resolve_uncached(&self, _ip: u64, _images: &[ImageSegments]) -> Option<ResolvedNativeFrame> {
        None
    }
}

fn demangle(name: &str) -> String {
    match Name::from(name).demangle(DemangleOptions::name_only()) {
        Some(demangled) => demangled,
        None => name.to_string(),
    }
}
