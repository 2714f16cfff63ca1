//! Demo servlet. Built on demand by the host:
//!
//!   rustc --edition 2021 --crate-type cdylib -o <version>.so servlet.rs
//!
//! The `#[repr(C)]` declarations below mirror the host's servlet ABI.

#![allow(non_snake_case, non_upper_case_globals)]

use std::ffi::c_void;

#[repr(C)]
pub struct Str {
    ptr: *const u8,
    len: usize,
}

impl Str {
    fn new(s: &str) -> Self {
        Self { ptr: s.as_ptr(), len: s.len() }
    }
}

#[repr(C)]
pub struct Bytes {
    ptr: *const u8,
    len: usize,
}

#[repr(C)]
pub struct Request {
    method: Str,
    path: Str,
    query: Str,
    body: Bytes,
}

#[repr(C)]
pub struct Response {
    ctx: *mut c_void,
    set_status: unsafe extern "C" fn(*mut c_void, u16),
    set_header: unsafe extern "C" fn(*mut c_void, Str, Str),
    write: unsafe extern "C" fn(*mut c_void, Bytes),
}

#[repr(C)]
pub struct Context {
    name: Str,
    version: Str,
}

#[no_mangle]
pub static ServletAbiVersion: u32 = 1;

#[no_mangle]
pub extern "C" fn ServeHTTP(_req: *const Request, res: *mut Response) {
    let body = b"hi";
    unsafe {
        let res = &*res;
        (res.set_status)(res.ctx, 200);
        (res.set_header)(res.ctx, Str::new("content-type"), Str::new("text/plain"));
        (res.write)(res.ctx, Bytes { ptr: body.as_ptr(), len: body.len() });
    }
}

#[no_mangle]
pub extern "C" fn StartServlet(_ctx: *const Context) {}

#[no_mangle]
pub extern "C" fn StopServlet(_ctx: *const Context) {}
