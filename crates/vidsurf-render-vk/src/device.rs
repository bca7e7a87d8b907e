// SPDX-License-Identifier: CEPL-1.0
//! Instance, physical device and logical device bring-up.
//!
//! Everything the import path needs is negotiated here once. A missing
//! extension, feature or limit is a startup failure, never a silent fallback.

use crate::unwind::on_error;
use anyhow::{anyhow, bail, Context, Result};
use ash::android::external_memory_android_hardware_buffer as ahb_ext;
use ash::ext::{debug_utils, queue_family_foreign};
use ash::khr::{
    bind_memory2, dedicated_allocation, external_memory, external_memory_capabilities,
    get_memory_requirements2, get_physical_device_properties2, maintenance1, push_descriptor,
    sampler_ycbcr_conversion, surface, swapchain,
};
use ash::{vk, Entry, Instance};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, c_void, CStr};
use tracing::{debug, error, info, trace, warn};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions the import and present paths cannot work without.
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 9] = [
    swapchain::NAME,
    ahb_ext::NAME,
    external_memory::NAME,
    dedicated_allocation::NAME,
    sampler_ycbcr_conversion::NAME,
    maintenance1::NAME,
    bind_memory2::NAME,
    get_memory_requirements2::NAME,
    push_descriptor::NAME,
];

/// Enabled when present; the foreign queue family constant is valid without it
/// on most Android drivers.
pub const OPTIONAL_DEVICE_EXTENSIONS: [&CStr; 1] = [queue_family_foreign::NAME];

pub const INSTANCE_EXTENSIONS: [&CStr; 2] = [
    get_physical_device_properties2::NAME,
    external_memory_capabilities::NAME,
];

/// Names from `wanted` that do not appear in `available`, in `wanted` order.
pub fn missing<'a>(available: &[&CStr], wanted: &[&'a CStr]) -> Vec<&'a CStr> {
    wanted
        .iter()
        .copied()
        .filter(|w| !available.iter().any(|a| **a == **w))
        .collect()
}

fn ext_names(props: &[vk::ExtensionProperties]) -> Vec<&CStr> {
    props
        .iter()
        .filter_map(|p| p.extension_name_as_c_str().ok())
        .collect()
}

fn join(names: &[&CStr]) -> String {
    names
        .iter()
        .map(|n| n.to_string_lossy())
        .collect::<Vec<_>>()
        .join(", ")
}

/// First queue family with graphics support.
pub fn pick_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || unsafe { (*data).p_message.is_null() } {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", "{msg}");
    } else {
        trace!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

struct Debug {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> Result<Debug> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = unsafe { loader.create_debug_utils_messenger(&ci, None) }
        .context("create_debug_utils_messenger")?;
    Ok(Debug { loader, messenger })
}

unsafe fn create_instance(
    entry: &Entry,
    display: RawDisplayHandle,
    validation: bool,
) -> Result<Instance> {
    let app = c"vidsurf";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: app.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let wsi = ash_window::enumerate_required_extensions(display)
        .context("enumerate_required_extensions")?;
    let mut wanted: Vec<&CStr> = wsi
        .iter()
        .map(|&p| unsafe { CStr::from_ptr(p) })
        .collect();
    wanted.extend(INSTANCE_EXTENSIONS);
    if validation {
        wanted.push(debug_utils::NAME);
    }

    let props = unsafe { entry.enumerate_instance_extension_properties(None) }
        .context("enumerate_instance_extension_properties")?;
    let absent = missing(&ext_names(&props), &wanted);
    if !absent.is_empty() {
        bail!("missing instance extensions: {}", join(&absent));
    }

    let mut layers: Vec<*const c_char> = Vec::new();
    if validation {
        let available = unsafe { entry.enumerate_instance_layer_properties() }
            .context("enumerate_instance_layer_properties")?;
        let found = available
            .iter()
            .any(|l| l.layer_name_as_c_str().ok() == Some(VALIDATION_LAYER));
        if !found {
            bail!("validation requested but {VALIDATION_LAYER:?} is not installed");
        }
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let ext_ptrs: Vec<*const c_char> = wanted.iter().map(|n| n.as_ptr()).collect();
    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        enabled_extension_count: ext_ptrs.len() as u32,
        pp_enabled_extension_names: ext_ptrs.as_ptr(),
        ..Default::default()
    };

    Ok(unsafe { entry.create_instance(&create_info, None) }.context("create_instance")?)
}

/// The negotiated device plus every extension loader the backend calls into.
pub struct DeviceContext {
    pub entry: Entry,
    pub instance: Instance,
    debug: Option<Debug>,
    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_family: u32,
    pub queue: vk::Queue,
    pub surface_loader: surface::Instance,
    pub swapchain_loader: swapchain::Device,
    pub props2_loader: get_physical_device_properties2::Instance,
    pub ycbcr_loader: sampler_ycbcr_conversion::Device,
    pub push_loader: push_descriptor::Device,
    pub ahb_loader: ahb_ext::Device,
}

/// What [`open_device`] hands back to [`DeviceContext::new`].
struct Opened {
    phys: vk::PhysicalDevice,
    device: ash::Device,
    queue_family: u32,
    queue: vk::Queue,
    extensions: usize,
    props2_loader: get_physical_device_properties2::Instance,
}

/// Physical device 0, its extension/feature/limit checks and the logical
/// device with Y'CbCr conversion enabled.
unsafe fn open_device(entry: &Entry, instance: &Instance) -> Result<Opened> {
    let phys = unsafe { instance.enumerate_physical_devices() }
        .context("enumerate_physical_devices")?
        .first()
        .copied()
        .ok_or_else(|| anyhow!("no Vulkan physical device"))?;

    let props = unsafe { instance.get_physical_device_properties(phys) };
    let name = props
        .device_name_as_c_str()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!(
        device = %name,
        api = %format!(
            "{}.{}.{}",
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
            vk::api_version_patch(props.api_version)
        ),
        "physical device"
    );

    // --- Extensions ---
    let dev_props = unsafe { instance.enumerate_device_extension_properties(phys) }
        .context("enumerate_device_extension_properties")?;
    let available = ext_names(&dev_props);
    let absent = missing(&available, &REQUIRED_DEVICE_EXTENSIONS);
    if !absent.is_empty() {
        bail!("missing device extensions: {}", join(&absent));
    }
    let mut enabled: Vec<&CStr> = REQUIRED_DEVICE_EXTENSIONS.to_vec();
    for opt in OPTIONAL_DEVICE_EXTENSIONS {
        if available.contains(&opt) {
            enabled.push(opt);
        } else {
            debug!(ext = %opt.to_string_lossy(), "optional device extension absent");
        }
    }

    let props2_loader = get_physical_device_properties2::Instance::new(entry, instance);

    // --- Features and limits ---
    let mut ycbcr_features = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut ycbcr_features);
    unsafe { props2_loader.get_physical_device_features2(phys, &mut features2) };
    let ycbcr_supported = ycbcr_features.sampler_ycbcr_conversion == vk::TRUE;
    if !ycbcr_supported {
        bail!("samplerYcbcrConversion feature not supported");
    }

    let mut push_props = vk::PhysicalDevicePushDescriptorPropertiesKHR::default();
    let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut push_props);
    unsafe { props2_loader.get_physical_device_properties2(phys, &mut props2) };
    if push_props.max_push_descriptors < 1 {
        bail!("device allows no push descriptors");
    }

    // --- Queue family ---
    let families = unsafe { instance.get_physical_device_queue_family_properties(phys) };
    let queue_family =
        pick_queue_family(&families).ok_or_else(|| anyhow!("no graphics queue family"))?;

    // --- Device ---
    let priorities = [1.0_f32];
    let queue_info = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };
    let ext_ptrs: Vec<*const c_char> = enabled.iter().map(|n| n.as_ptr()).collect();
    let mut enable_ycbcr =
        vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default().sampler_ycbcr_conversion(true);
    let queue_infos = [queue_info];
    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&ext_ptrs)
        .push_next(&mut enable_ycbcr);
    let device = unsafe { instance.create_device(phys, &device_info, None) }
        .context("create_device")?;
    let queue = unsafe { device.get_device_queue(queue_family, 0) };

    Ok(Opened {
        phys,
        device,
        queue_family,
        queue,
        extensions: enabled.len(),
        props2_loader,
    })
}

/// Messenger first, instance last.
unsafe fn destroy_instance(instance: &Instance, debug: Option<&Debug>) {
    unsafe {
        if let Some(dbg) = debug {
            dbg.loader.destroy_debug_utils_messenger(dbg.messenger, None);
        }
        instance.destroy_instance(None);
    }
}

impl DeviceContext {
    /// STRICT ORDER:
    /// 1) instance (WSI + capability extensions, validation layer if asked)
    /// 2) debug messenger
    /// 3) physical device 0 and its extension/feature/limit checks
    /// 4) logical device with Y'CbCr conversion enabled
    ///
    /// A failure after step 1 destroys the instance (and messenger) again.
    pub unsafe fn new(display: RawDisplayHandle, validation: bool) -> Result<Self> {
        let entry = Entry::linked();
        let instance = unsafe { create_instance(&entry, display, validation) }?;
        let debug = if validation {
            let made = unsafe { create_debug_messenger(&entry, &instance) };
            Some(on_error(made, || unsafe { destroy_instance(&instance, None) })?)
        } else {
            None
        };

        let opened = unsafe { open_device(&entry, &instance) };
        let Opened {
            phys,
            device,
            queue_family,
            queue,
            extensions,
            props2_loader,
        } = on_error(opened, || unsafe { destroy_instance(&instance, debug.as_ref()) })?;

        info!(queue_family, extensions, "device ready");

        Ok(Self {
            surface_loader: surface::Instance::new(&entry, &instance),
            swapchain_loader: swapchain::Device::new(&instance, &device),
            ycbcr_loader: sampler_ycbcr_conversion::Device::new(&instance, &device),
            push_loader: push_descriptor::Device::new(&instance, &device),
            ahb_loader: ahb_ext::Device::new(&instance, &device),
            props2_loader,
            entry,
            instance,
            debug,
            phys,
            device,
            queue_family,
            queue,
        })
    }

    /// Device first, then the messenger, instance last. Callers have already
    /// destroyed every object created from this context.
    pub unsafe fn destroy(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            destroy_instance(&self.instance, self.debug.take().as_ref());
        }
    }
}
