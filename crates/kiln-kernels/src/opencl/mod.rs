//! OpenCL backend.
//!
//! Provides:
//! - Runtime OpenCL detection and platform/device probing
//! - Context, queue and program bring-up with build-log capture
//! - Buffer, argument and NDRange calls behind [`ComputeBackend`]
//!
//! All calls go through runtime-loaded function pointers from `ffi.rs`.

pub mod ffi;

use std::ffi::{c_char, c_void, CString};
use std::fmt;
use std::ptr;

use serde::{Deserialize, Serialize};

use self::ffi::{
    check_cl, ClBitfield, ClCommandQueue, ClContext, ClDeviceId, ClInt, ClKernel, ClMem,
    ClPlatformId, ClProgram, ClUint, OpenClApi, CL_SUCCESS, CL_TRUE,
};
use crate::backend::{ComputeBackend, KernelArg, MemAccess};
use crate::error::{DispatchError, Result};
use crate::work::WorkSize;

/// Which class of device to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Gpu,
    Cpu,
    Accelerator,
    All,
}

impl DeviceType {
    fn mask(self) -> ClBitfield {
        match self {
            DeviceType::Gpu => ffi::CL_DEVICE_TYPE_GPU,
            DeviceType::Cpu => ffi::CL_DEVICE_TYPE_CPU,
            DeviceType::Accelerator => ffi::CL_DEVICE_TYPE_ACCELERATOR,
            DeviceType::All => ffi::CL_DEVICE_TYPE_ALL,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Gpu => write!(f, "gpu"),
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Accelerator => write!(f, "accelerator"),
            DeviceType::All => write!(f, "any"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" => Ok(DeviceType::Gpu),
            "cpu" => Ok(DeviceType::Cpu),
            "accelerator" => Ok(DeviceType::Accelerator),
            "all" | "any" => Ok(DeviceType::All),
            other => Err(format!("unknown device type '{}'", other)),
        }
    }
}

/// OpenCL device selection. The first platform and its first device of
/// `device_type` are used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenClConfig {
    #[serde(default)]
    pub device_type: DeviceType,
}

/// Check if an OpenCL loader is present and exposes at least one platform.
pub fn is_opencl_available() -> bool {
    match ffi::opencl_api() {
        Some(api) => first_platform(api).is_ok(),
        None => false,
    }
}

// ============================================================================
// Owned handles
// ============================================================================

/// Context, queue and program, released on drop if still held.
///
/// Used both while the backend is being brought up, so a failure partway
/// through releases what was already created, and as the backend's storage.
struct Handles {
    api: &'static OpenClApi,
    context: ClContext,
    queue: ClCommandQueue,
    program: ClProgram,
}

impl Handles {
    fn empty(api: &'static OpenClApi) -> Self {
        Self {
            api,
            context: ptr::null_mut(),
            queue: ptr::null_mut(),
            program: ptr::null_mut(),
        }
    }
}

/// Release `*handle` once and null it.
fn release_handle(
    release: unsafe extern "C" fn(*mut c_void) -> ClInt,
    handle: &mut *mut c_void,
    call: &str,
) -> Result<()> {
    if handle.is_null() {
        return Ok(());
    }
    let raw = std::mem::replace(handle, ptr::null_mut());
    check_cl(unsafe { release(raw) }, call)
}

impl Drop for Handles {
    fn drop(&mut self) {
        let api = self.api;
        let _ = release_handle(api.release_context, &mut self.context, "clReleaseContext");
        let _ = release_handle(api.release_program, &mut self.program, "clReleaseProgram");
        let _ = release_handle(api.release_command_queue, &mut self.queue, "clReleaseCommandQueue");
    }
}

// ============================================================================
// Backend
// ============================================================================

/// A compiled kernel object.
#[derive(Debug)]
pub struct OpenClKernel(ClKernel);

/// A device memory object.
#[derive(Debug)]
pub struct OpenClBuffer(ClMem);

/// One OpenCL device with a context, in-order queue and built program.
pub struct OpenClBackend {
    api: &'static OpenClApi,
    device_name: String,
    handles: Handles,
}

impl OpenClBackend {
    /// Build log for the program on this device.
    fn build_log(api: &OpenClApi, program: ClProgram, device: ClDeviceId) -> Result<String> {
        let mut size: usize = 0;
        check_cl(
            unsafe {
                (api.get_program_build_info)(
                    program,
                    device,
                    ffi::CL_PROGRAM_BUILD_LOG,
                    0,
                    ptr::null_mut(),
                    &mut size,
                )
            },
            "clGetProgramBuildInfo",
        )?;
        let mut buf = vec![0u8; size];
        check_cl(
            unsafe {
                (api.get_program_build_info)(
                    program,
                    device,
                    ffi::CL_PROGRAM_BUILD_LOG,
                    size,
                    buf.as_mut_ptr() as *mut c_void,
                    ptr::null_mut(),
                )
            },
            "clGetProgramBuildInfo",
        )?;
        Ok(ffi::trim_c_string(&buf))
    }
}

impl ComputeBackend for OpenClBackend {
    type Config = OpenClConfig;
    type Kernel = OpenClKernel;
    type Buffer = OpenClBuffer;

    fn open(config: &OpenClConfig, source: &str) -> Result<Self> {
        let api = ffi::require_api()?;
        let platform = first_platform(api)?;
        let device = first_device(api, platform, config.device_type)?;

        let mut handles = Handles::empty(api);
        let mut err: ClInt = CL_SUCCESS;

        handles.context = unsafe {
            (api.create_context)(ptr::null(), 1, &device, ptr::null(), ptr::null_mut(), &mut err)
        };
        check_cl(err, "clCreateContext")?;

        handles.queue = unsafe { (api.create_command_queue)(handles.context, device, 0, &mut err) };
        check_cl(err, "clCreateCommandQueue")?;

        let src_ptr = source.as_ptr() as *const c_char;
        let src_len = source.len();
        handles.program = unsafe {
            (api.create_program_with_source)(handles.context, 1, &src_ptr, &src_len, &mut err)
        };
        check_cl(err, "clCreateProgramWithSource")?;

        let code = unsafe {
            (api.build_program)(handles.program, 1, &device, ptr::null(), ptr::null(), ptr::null_mut())
        };
        if code != CL_SUCCESS {
            let log = Self::build_log(api, handles.program, device)
                .unwrap_or_else(|e| format!("(build log unavailable: {})", e));
            let log = if log.is_empty() { format!("clBuildProgram returned {}", code) } else { log };
            tracing::error!("kernel program build failed:\n{}", log);
            return Err(DispatchError::Build { log });
        }

        let device_name = unsafe {
            ffi::info_string(api.get_device_info, device, ffi::CL_DEVICE_NAME, "clGetDeviceInfo")
        }
        .unwrap_or_else(|_| "unknown OpenCL device".to_string());

        Ok(Self { api, device_name, handles })
    }

    fn device_name(&self) -> String {
        self.device_name.clone()
    }

    fn create_kernel(&self, name: &str) -> Result<OpenClKernel> {
        let not_found = || DispatchError::KernelNotFound { name: name.to_string() };
        let c_name = CString::new(name).map_err(|_| not_found())?;
        let mut err: ClInt = CL_SUCCESS;
        let kernel = unsafe { (self.api.create_kernel)(self.handles.program, c_name.as_ptr(), &mut err) };
        match err {
            CL_SUCCESS => Ok(OpenClKernel(kernel)),
            ffi::CL_INVALID_KERNEL_NAME | ffi::CL_INVALID_KERNEL_DEFINITION => Err(not_found()),
            code => Err(DispatchError::device(code, format!("clCreateKernel({})", name))),
        }
    }

    fn create_buffer(&self, access: MemAccess, nbytes: usize) -> Result<OpenClBuffer> {
        let flags = match access {
            MemAccess::ReadOnly => ffi::CL_MEM_READ_ONLY,
            MemAccess::WriteOnly => ffi::CL_MEM_WRITE_ONLY,
            MemAccess::ReadWrite => ffi::CL_MEM_READ_WRITE,
        };
        let mut err: ClInt = CL_SUCCESS;
        let mem = unsafe {
            (self.api.create_buffer)(self.handles.context, flags, nbytes, ptr::null_mut(), &mut err)
        };
        check_cl(err, &format!("clCreateBuffer({} bytes)", nbytes))?;
        Ok(OpenClBuffer(mem))
    }

    fn write_buffer(&self, buffer: &OpenClBuffer, data: &[u8]) -> Result<()> {
        check_cl(
            unsafe {
                (self.api.enqueue_write_buffer)(
                    self.handles.queue,
                    buffer.0,
                    CL_TRUE,
                    0,
                    data.len(),
                    data.as_ptr() as *const c_void,
                    0,
                    ptr::null(),
                    ptr::null_mut(),
                )
            },
            "clEnqueueWriteBuffer",
        )
    }

    fn read_buffer(&self, buffer: &OpenClBuffer, out: &mut [u8]) -> Result<()> {
        check_cl(
            unsafe {
                (self.api.enqueue_read_buffer)(
                    self.handles.queue,
                    buffer.0,
                    CL_TRUE,
                    0,
                    out.len(),
                    out.as_mut_ptr() as *mut c_void,
                    0,
                    ptr::null(),
                    ptr::null_mut(),
                )
            },
            "clEnqueueReadBuffer",
        )
    }

    fn set_arg(&self, kernel: &OpenClKernel, index: u32, arg: KernelArg<'_, OpenClBuffer>) -> Result<()> {
        let code = match arg {
            KernelArg::Buffer(buf) => {
                let mem: ClMem = buf.0;
                unsafe {
                    (self.api.set_kernel_arg)(
                        kernel.0,
                        index as ClUint,
                        std::mem::size_of::<ClMem>(),
                        &mem as *const ClMem as *const c_void,
                    )
                }
            }
            KernelArg::Int(value) => unsafe {
                (self.api.set_kernel_arg)(
                    kernel.0,
                    index as ClUint,
                    std::mem::size_of::<i32>(),
                    &value as *const i32 as *const c_void,
                )
            },
        };
        check_cl(code, &format!("clSetKernelArg({})", index))
    }

    fn enqueue(&self, kernel: &OpenClKernel, work: WorkSize) -> Result<()> {
        check_cl(
            unsafe {
                (self.api.enqueue_nd_range_kernel)(
                    self.handles.queue,
                    kernel.0,
                    1,
                    ptr::null(),
                    &work.global,
                    &work.local,
                    0,
                    ptr::null(),
                    ptr::null_mut(),
                )
            },
            "clEnqueueNDRangeKernel",
        )
    }

    fn finish(&self) -> Result<()> {
        check_cl(unsafe { (self.api.finish)(self.handles.queue) }, "clFinish")
    }

    fn release_buffer(&self, buffer: OpenClBuffer) -> Result<()> {
        check_cl(unsafe { (self.api.release_mem_object)(buffer.0) }, "clReleaseMemObject")
    }

    fn release_kernel(&self, kernel: OpenClKernel) -> Result<()> {
        check_cl(unsafe { (self.api.release_kernel)(kernel.0) }, "clReleaseKernel")
    }

    fn release_context(&mut self) -> Result<()> {
        release_handle(self.api.release_context, &mut self.handles.context, "clReleaseContext")
    }

    fn release_program(&mut self) -> Result<()> {
        release_handle(self.api.release_program, &mut self.handles.program, "clReleaseProgram")
    }

    fn release_queue(&mut self) -> Result<()> {
        release_handle(
            self.api.release_command_queue,
            &mut self.handles.queue,
            "clReleaseCommandQueue",
        )
    }
}

// ============================================================================
// Platform discovery
// ============================================================================

fn first_platform(api: &OpenClApi) -> Result<ClPlatformId> {
    let mut platform: ClPlatformId = ptr::null_mut();
    let mut count: ClUint = 0;
    let code = unsafe { (api.get_platform_ids)(1, &mut platform, &mut count) };
    if code == ffi::CL_PLATFORM_NOT_FOUND_KHR || (code == CL_SUCCESS && count == 0) {
        return Err(DispatchError::NoPlatform);
    }
    check_cl(code, "clGetPlatformIDs")?;
    Ok(platform)
}

fn first_device(api: &OpenClApi, platform: ClPlatformId, device_type: DeviceType) -> Result<ClDeviceId> {
    let mut device: ClDeviceId = ptr::null_mut();
    let mut count: ClUint = 0;
    let code = unsafe { (api.get_device_ids)(platform, device_type.mask(), 1, &mut device, &mut count) };
    if code == ffi::CL_DEVICE_NOT_FOUND || (code == CL_SUCCESS && count == 0) {
        return Err(DispatchError::NoDevice { device_type: device_type.to_string() });
    }
    check_cl(code, "clGetDeviceIDs")?;
    Ok(device)
}

/// One device as reported by [`probe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub max_work_group_size: usize,
    pub global_mem_bytes: u64,
}

/// One platform and all of its devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    pub name: String,
    pub version: String,
    pub devices: Vec<DeviceInfo>,
}

/// Enumerate every platform and device visible to the loader.
pub fn probe() -> Result<Vec<PlatformInfo>> {
    let api = ffi::require_api()?;

    let mut count: ClUint = 0;
    let code = unsafe { (api.get_platform_ids)(0, ptr::null_mut(), &mut count) };
    if code == ffi::CL_PLATFORM_NOT_FOUND_KHR {
        return Ok(Vec::new());
    }
    check_cl(code, "clGetPlatformIDs")?;
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut platforms: Vec<ClPlatformId> = vec![ptr::null_mut(); count as usize];
    check_cl(
        unsafe { (api.get_platform_ids)(count, platforms.as_mut_ptr(), ptr::null_mut()) },
        "clGetPlatformIDs",
    )?;

    platforms
        .into_iter()
        .map(|platform| {
            let name = unsafe {
                ffi::info_string(api.get_platform_info, platform, ffi::CL_PLATFORM_NAME, "clGetPlatformInfo")
            }?;
            let version = unsafe {
                ffi::info_string(api.get_platform_info, platform, ffi::CL_PLATFORM_VERSION, "clGetPlatformInfo")
            }?;
            let devices = probe_devices(api, platform)?;
            Ok(PlatformInfo { name, version, devices })
        })
        .collect()
}

fn probe_devices(api: &OpenClApi, platform: ClPlatformId) -> Result<Vec<DeviceInfo>> {
    let mut count: ClUint = 0;
    let code = unsafe {
        (api.get_device_ids)(platform, ffi::CL_DEVICE_TYPE_ALL, 0, ptr::null_mut(), &mut count)
    };
    if code == ffi::CL_DEVICE_NOT_FOUND {
        return Ok(Vec::new());
    }
    check_cl(code, "clGetDeviceIDs")?;
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut devices: Vec<ClDeviceId> = vec![ptr::null_mut(); count as usize];
    check_cl(
        unsafe {
            (api.get_device_ids)(platform, ffi::CL_DEVICE_TYPE_ALL, count, devices.as_mut_ptr(), ptr::null_mut())
        },
        "clGetDeviceIDs",
    )?;

    devices
        .into_iter()
        .map(|device| {
            let name = unsafe {
                ffi::info_string(api.get_device_info, device, ffi::CL_DEVICE_NAME, "clGetDeviceInfo")
            }?;
            let mut max_work_group_size: usize = 0;
            check_cl(
                unsafe {
                    (api.get_device_info)(
                        device,
                        ffi::CL_DEVICE_MAX_WORK_GROUP_SIZE,
                        std::mem::size_of::<usize>(),
                        &mut max_work_group_size as *mut usize as *mut c_void,
                        ptr::null_mut(),
                    )
                },
                "clGetDeviceInfo",
            )?;
            let mut global_mem_bytes: u64 = 0;
            check_cl(
                unsafe {
                    (api.get_device_info)(
                        device,
                        ffi::CL_DEVICE_GLOBAL_MEM_SIZE,
                        std::mem::size_of::<u64>(),
                        &mut global_mem_bytes as *mut u64 as *mut c_void,
                        ptr::null_mut(),
                    )
                },
                "clGetDeviceInfo",
            )?;
            Ok(DeviceInfo { name, max_work_group_size, global_mem_bytes })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_parse() {
        assert_eq!("gpu".parse::<DeviceType>().unwrap(), DeviceType::Gpu);
        assert_eq!("CPU".parse::<DeviceType>().unwrap(), DeviceType::Cpu);
        assert_eq!("any".parse::<DeviceType>().unwrap(), DeviceType::All);
        assert!("fpga".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_device_type_masks_distinct() {
        let masks = [DeviceType::Gpu, DeviceType::Cpu, DeviceType::Accelerator].map(DeviceType::mask);
        assert_eq!(masks[0] & masks[1], 0);
        assert_eq!(masks[1] & masks[2], 0);
        assert_eq!(DeviceType::All.mask() & masks[0], masks[0]);
    }

    #[test]
    fn test_config_defaults_to_gpu() {
        assert_eq!(OpenClConfig::default().device_type, DeviceType::Gpu);
    }
}
