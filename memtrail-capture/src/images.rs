// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Enumeration of loaded images and their mapped segments. Captured once
//! at tracking start and again after every `dlopen`, each time under a
//! fresh segment generation so the reader can invalidate its native-frame
//! tables.

use memtrail_format::{ImageSegments, Segment};

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::ffi::CStr;
    use std::os::raw::{c_int, c_void};

    struct CollectState {
        images: Vec<ImageSegments>,
        main_executable: Option<Box<str>>,
    }

    unsafe extern "C" fn phdr_callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let state = &mut *(data as *mut CollectState);
        let info = &*info;
        let name = if info.dlpi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };
        // The empty name is the main executable; resolve it so symbol
        // resolution has a real path to open.
        let path: Box<str> = if name.is_empty() {
            state
                .main_executable
                .clone()
                .unwrap_or_else(|| Box::from(""))
        } else {
            name.into()
        };
        let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let segments: Vec<Segment> = phdrs
            .iter()
            .filter(|phdr| phdr.p_type == libc::PT_LOAD)
            .map(|phdr| Segment {
                vaddr: info.dlpi_addr.wrapping_add(phdr.p_vaddr) as u64,
                size: phdr.p_memsz as u64,
            })
            .collect();
        if !segments.is_empty() {
            state.images.push(ImageSegments {
                path,
                base: info.dlpi_addr as u64,
                segments,
            });
        }
        0
    }

    pub fn collect() -> Vec<ImageSegments> {
        let main_executable = std::fs::read_link("/proc/self/exe")
            .ok()
            .map(|p| p.to_string_lossy().into_owned().into());
        let mut state = CollectState {
            images: Vec::new(),
            main_executable,
        };
        // SAFETY: the callback only reads the phdr info handed to it and
        // the state pointer lives for the duration of the call.
        unsafe {
            libc::dl_iterate_phdr(
                Some(phdr_callback),
                &mut state as *mut CollectState as *mut c_void,
            );
        }
        state.images
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use super::*;
    use std::ffi::CStr;

    pub fn collect() -> Vec<ImageSegments> {
        let mut images = Vec::new();
        // SAFETY: the dyld APIs below are documented to be callable at any
        // time; indices may race image unloads, which they tolerate by
        // returning null.
        unsafe {
            let count = libc::_dyld_image_count();
            for i in 0..count {
                let header = libc::_dyld_get_image_header(i);
                if header.is_null() {
                    continue;
                }
                let slide = libc::_dyld_get_image_vmaddr_slide(i) as u64;
                let name = libc::_dyld_get_image_name(i);
                let path: Box<str> = if name.is_null() {
                    Box::from("")
                } else {
                    CStr::from_ptr(name).to_string_lossy().into_owned().into()
                };
                let mut segments = Vec::new();
                let header64 = header as *const libc::mach_header_64;
                let mut cmd = (header64 as *const u8)
                    .add(std::mem::size_of::<libc::mach_header_64>())
                    as *const libc::load_command;
                for _ in 0..(*header64).ncmds {
                    if (*cmd).cmd == libc::LC_SEGMENT_64 {
                        let seg = cmd as *const libc::segment_command_64;
                        if (*seg).vmsize > 0 {
                            segments.push(Segment {
                                vaddr: (*seg).vmaddr.wrapping_add(slide),
                                size: (*seg).vmsize,
                            });
                        }
                    }
                    cmd = (cmd as *const u8).add((*cmd).cmdsize as usize)
                        as *const libc::load_command;
                }
                if !segments.is_empty() {
                    images.push(ImageSegments {
                        path,
                        base: slide,
                        segments,
                    });
                }
            }
        }
        images
    }
}

/// Every currently loaded image with at least one mapped segment.
pub fn collect_images() -> Vec<ImageSegments> {
    platform::collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_images_finds_this_binary() {
        let images = collect_images();
        assert!(!images.is_empty());
        assert!(images.iter().all(|img| !img.segments.is_empty()));
        // The test binary itself must be among the images and contain the
        // address of one of our functions.
        let here = collect_images as usize as u64;
        assert!(images.iter().any(|img| img.contains(here)));
    }

    #[test]
    fn test_collect_images_have_paths() {
        let images = collect_images();
        assert!(images.iter().any(|img| !img.path.is_empty()));
    }
}
