//! GL-style graphics bindings.
//!
//! Exposes a small OpenGL ES subset to the module under `env`. Every call is
//! forwarded to a [`RasterContext`]; host objects (programs, shaders,
//! textures, uniform locations) never cross into the guest, which only sees
//! ids from a per-class [`HandleTable`].
//!
//! [`HeadlessContext`] is a recording implementation for tests and for
//! running graphics modules without a display.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use spin::Mutex;
use wasmtime::{Caller, Linker};

use crate::handles::HandleTable;
use crate::host::{guest_view, ImportExtension, ENV_MODULE};
use crate::memory::GuestMemory;
use crate::session::{FaultCategory, HostFault, HostSession};
use crate::strings;

/// Native object name inside the raster context.
pub type NativeObject = u64;

/// `GL_INFO_LOG_LENGTH`.
pub const GL_INFO_LOG_LENGTH: u32 = 0x8B84;
/// `GL_LINK_STATUS`.
pub const GL_LINK_STATUS: u32 = 0x8B82;
/// `GL_COMPILE_STATUS`.
pub const GL_COMPILE_STATUS: u32 = 0x8B81;

/// Row alignment of client pixel data.
const UNPACK_ALIGNMENT: usize = 4;

/// Uniform reported by the context after a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUniform {
    /// Name as reported, possibly with a `[0]` suffix for arrays.
    pub name: String,
    /// Number of array elements (1 for scalars).
    pub size: u32,
}

/// The rasterization context the bindings drive.
pub trait RasterContext {
    /// Create the drawing surface. Returns `false` if no context could be made.
    fn setup(&mut self, width: u32, height: u32) -> bool;
    fn get_error(&mut self) -> u32;
    fn enable(&mut self, cap: u32);
    fn disable(&mut self, cap: u32);
    fn clear(&mut self, mask: u32);
    fn clear_color(&mut self, r: f32, g: f32, b: f32, a: f32);
    fn viewport(&mut self, x: i32, y: i32, width: i32, height: i32);

    fn create_program(&mut self) -> Option<NativeObject>;
    fn delete_program(&mut self, program: NativeObject);
    fn create_shader(&mut self, kind: u32) -> Option<NativeObject>;
    fn delete_shader(&mut self, shader: NativeObject);
    fn shader_source(&mut self, shader: NativeObject, source: &str);
    fn compile_shader(&mut self, shader: NativeObject);
    fn shader_parameter(&mut self, shader: NativeObject, param: u32) -> i32;
    fn shader_info_log(&mut self, shader: NativeObject) -> String;
    fn program_parameter(&mut self, program: NativeObject, param: u32) -> i32;
    fn program_info_log(&mut self, program: NativeObject) -> String;
    fn attach_shader(&mut self, program: NativeObject, shader: NativeObject);
    fn link_program(&mut self, program: NativeObject);
    fn use_program(&mut self, program: Option<NativeObject>);
    fn active_uniforms(&mut self, program: NativeObject) -> Vec<ActiveUniform>;
    fn uniform_location(&mut self, program: NativeObject, name: &str) -> Option<NativeObject>;
    fn uniform_f(&mut self, location: Option<NativeObject>, values: &[f32]);
    fn uniform_i(&mut self, location: Option<NativeObject>, values: &[i32]);
    fn draw_arrays(&mut self, mode: u32, first: i32, count: i32);

    fn create_texture(&mut self) -> Option<NativeObject>;
    fn delete_texture(&mut self, texture: NativeObject);
    fn bind_texture(&mut self, target: u32, texture: Option<NativeObject>);
    fn active_texture(&mut self, unit: u32);
    fn tex_image_2d(&mut self, upload: &TextureUpload<'_>);
    fn generate_mipmap(&mut self, target: u32);
}

/// Arguments of a `glTexImage2D` call, with the pixel span already resolved.
#[derive(Debug, Clone, Copy)]
pub struct TextureUpload<'a> {
    pub target: u32,
    pub level: i32,
    pub internal_format: i32,
    pub width: i32,
    pub height: i32,
    pub border: i32,
    pub format: u32,
    pub ty: u32,
    pub pixels: Option<&'a [u8]>,
}

/// Byte length of a client pixel rectangle, or `None` for an unknown
/// format or type.
pub fn pixel_data_size(format: u32, ty: u32, width: i32, height: i32) -> Option<usize> {
    let channels = match format {
        0x1906 | 0x1909 | 0x1902 => 1, // ALPHA, LUMINANCE, DEPTH_COMPONENT
        0x190A => 2,                   // LUMINANCE_ALPHA
        0x1907 | 0x8C40 => 3,          // RGB, SRGB
        0x1908 | 0x8C42 => 4,          // RGBA, SRGB_ALPHA
        _ => return None,
    };
    let pixel_size = match ty {
        0x1401 => channels,                            // UNSIGNED_BYTE
        0x1403 | 0x8D61 => channels * 2,               // UNSIGNED_SHORT, HALF_FLOAT
        0x1405 | 0x1406 => channels * 4,               // UNSIGNED_INT, FLOAT
        0x84FA => 4,                                   // UNSIGNED_INT_24_8
        0x8363 | 0x8033 | 0x8034 => 2,                 // packed 16-bit formats
        _ => return None,
    };

    if height <= 0 || width <= 0 {
        return Some(0);
    }
    let plain_row = width as usize * pixel_size;
    let aligned_row = plain_row.div_ceil(UNPACK_ALIGNMENT) * UNPACK_ALIGNMENT;
    Some((height as usize - 1) * aligned_row + plain_row)
}

/// Uniforms of one linked program.
#[derive(Debug, Default, Clone)]
struct ProgramInfo {
    /// Base name -> (array size, id of element 0).
    uniforms: BTreeMap<String, (u32, u32)>,
    /// Ids allocated for this program's locations.
    location_ids: Vec<u32>,
    max_uniform_length: usize,
}

/// Split `name[index]` into `(name, index)`. A name without a trailing
/// `]` has index 0; `None` if the index is not a number.
fn split_array_suffix(name: &str) -> Option<(&str, u32)> {
    if !name.ends_with(']') {
        return Some((name, 0));
    }
    let open = name.rfind('[')?;
    let index = &name[open + 1..name.len() - 1];
    let index = if index.is_empty() { 0 } else { index.parse().ok()? };
    Some((&name[..open], index))
}

/// Graphics state of one session.
pub struct GraphicsLayer {
    context: Box<dyn RasterContext>,
    programs: HandleTable<NativeObject>,
    shaders: HandleTable<NativeObject>,
    textures: HandleTable<NativeObject>,
    uniforms: HandleTable<Option<NativeObject>>,
    program_infos: BTreeMap<u32, ProgramInfo>,
}

fn lost_context() -> HostFault {
    HostFault::new(
        FaultCategory::Crash,
        "GL_INVALID_OPERATION: Fail to create gl object, gl context may be lost!",
    )
}

impl GraphicsLayer {
    pub fn new(context: Box<dyn RasterContext>) -> Self {
        GraphicsLayer {
            context,
            programs: HandleTable::new(),
            shaders: HandleTable::new(),
            textures: HandleTable::new(),
            uniforms: HandleTable::new(),
            program_infos: BTreeMap::new(),
        }
    }

    pub fn context_mut(&mut self) -> &mut dyn RasterContext {
        self.context.as_mut()
    }

    /// Number of live programs.
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Number of live shaders.
    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    /// Number of live textures.
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn create_program(&mut self) -> Result<u32, HostFault> {
        let program = self.context.create_program().ok_or_else(lost_context)?;
        Ok(self.programs.allocate(program))
    }

    pub fn delete_program(&mut self, id: u32) {
        if let Some(program) = self.programs.release(id) {
            self.context.delete_program(program);
            self.drop_uniforms(id);
        }
    }

    pub fn create_shader(&mut self, kind: u32) -> Result<u32, HostFault> {
        let shader = self.context.create_shader(kind).ok_or_else(lost_context)?;
        Ok(self.shaders.allocate(shader))
    }

    pub fn delete_shader(&mut self, id: u32) {
        if let Some(shader) = self.shaders.release(id) {
            self.context.delete_shader(shader);
        }
    }

    pub fn shader_source(&mut self, id: u32, source: &str) {
        if let Some(&shader) = self.shaders.get(id) {
            self.context.shader_source(shader, source);
        }
    }

    pub fn compile_shader(&mut self, id: u32) {
        if let Some(&shader) = self.shaders.get(id) {
            self.context.compile_shader(shader);
        }
    }

    pub fn shader_iv(&mut self, id: u32, param: u32) -> i32 {
        let Some(&shader) = self.shaders.get(id) else {
            return 0;
        };
        if param == GL_INFO_LOG_LENGTH {
            self.context.shader_info_log(shader).len() as i32
        } else {
            self.context.shader_parameter(shader, param)
        }
    }

    pub fn shader_info_log(&mut self, id: u32) -> String {
        match self.shaders.get(id) {
            Some(&shader) => self.context.shader_info_log(shader),
            None => String::new(),
        }
    }

    pub fn program_iv(&mut self, id: u32, param: u32) -> i32 {
        let Some(&program) = self.programs.get(id) else {
            return 0;
        };
        if param == GL_INFO_LOG_LENGTH {
            self.context.program_info_log(program).len() as i32
        } else {
            self.context.program_parameter(program, param)
        }
    }

    pub fn program_info_log(&mut self, id: u32) -> String {
        match self.programs.get(id) {
            Some(&program) => self.context.program_info_log(program),
            None => String::new(),
        }
    }

    pub fn attach_shader(&mut self, program: u32, shader: u32) {
        if let (Some(&program), Some(&shader)) = (self.programs.get(program), self.shaders.get(shader)) {
            self.context.attach_shader(program, shader);
        }
    }

    /// Link a program and rebuild its uniform table.
    pub fn link_program(&mut self, id: u32) {
        let Some(&program) = self.programs.get(id) else {
            return;
        };
        self.context.link_program(program);
        self.drop_uniforms(id);

        let mut info = ProgramInfo::default();
        for uniform in self.context.active_uniforms(program) {
            info.max_uniform_length = info.max_uniform_length.max(uniform.name.len() + 1);
            let base = match split_array_suffix(&uniform.name) {
                Some((base, _)) => base.to_string(),
                None => uniform.name.clone(),
            };

            let Some(location) = self.context.uniform_location(program, &base) else {
                continue;
            };
            // Element ids are consecutive so `base_id + index` addresses element `index`.
            let base_id = self.uniforms.allocate(Some(location));
            info.location_ids.push(base_id);
            for index in 1..uniform.size {
                let element = self
                    .context
                    .uniform_location(program, &format!("{}[{}]", base, index));
                info.location_ids.push(self.uniforms.allocate(element));
            }
            info.uniforms.insert(base, (uniform.size, base_id));
        }

        log::debug!("[wajs:gl] linked program {} ({} uniforms)", id, info.uniforms.len());
        self.program_infos.insert(id, info);
    }

    pub fn use_program(&mut self, id: u32) {
        let program = match id {
            0 => None,
            id => self.programs.get(id).copied(),
        };
        self.context.use_program(program);
    }

    /// Guest id of a uniform location, or -1.
    pub fn uniform_location(&self, program: u32, name: &str) -> i32 {
        let Some(info) = self.program_infos.get(&program) else {
            return -1;
        };
        let Some((base, index)) = split_array_suffix(name) else {
            return -1;
        };
        match info.uniforms.get(base) {
            Some(&(size, base_id)) if index < size => (base_id + index) as i32,
            _ => -1,
        }
    }

    /// Longest active uniform name of a linked program, NUL included.
    pub fn max_uniform_length(&self, program: u32) -> usize {
        self.program_infos
            .get(&program)
            .map_or(0, |info| info.max_uniform_length)
    }

    fn location(&self, id: i32) -> Option<NativeObject> {
        u32::try_from(id)
            .ok()
            .and_then(|id| self.uniforms.get(id).copied().flatten())
    }

    pub fn uniform_f(&mut self, location: i32, values: &[f32]) {
        let location = self.location(location);
        self.context.uniform_f(location, values);
    }

    pub fn uniform_i(&mut self, location: i32, values: &[i32]) {
        let location = self.location(location);
        self.context.uniform_i(location, values);
    }

    /// Create `n` textures, returning their ids.
    pub fn gen_textures(&mut self, n: u32) -> Result<Vec<u32>, HostFault> {
        let mut ids = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let texture = self.context.create_texture().ok_or_else(lost_context)?;
            ids.push(self.textures.allocate(texture));
        }
        Ok(ids)
    }

    pub fn delete_texture(&mut self, id: u32) {
        if let Some(texture) = self.textures.release(id) {
            self.context.delete_texture(texture);
        }
    }

    pub fn bind_texture(&mut self, target: u32, id: u32) {
        let texture = self.textures.get(id).copied();
        self.context.bind_texture(target, texture);
    }

    fn drop_uniforms(&mut self, program: u32) {
        if let Some(info) = self.program_infos.remove(&program) {
            for id in info.location_ids {
                self.uniforms.release(id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Headless context
// ---------------------------------------------------------------------------

/// Everything a [`HeadlessContext`] has seen.
#[derive(Debug, Default, Clone)]
pub struct HeadlessState {
    /// Names of the calls made, in order.
    pub calls: Vec<String>,
    /// Surface size after `setup`.
    pub surface: Option<(u32, u32)>,
    pub clear_color: [f32; 4],
    pub viewport: [i32; 4],
    /// Live native objects.
    pub objects: BTreeSet<NativeObject>,
    /// Shader sources by native name.
    pub sources: BTreeMap<NativeObject, String>,
    /// Uniform values by native location.
    pub uniform_values: BTreeMap<NativeObject, Vec<f32>>,
    /// `(width, height, byte length)` of each texture upload.
    pub uploads: Vec<(i32, i32, usize)>,
    /// Uniforms every program reports after linking.
    pub active_uniforms: Vec<ActiveUniform>,
    /// Make object creation fail.
    pub fail_creates: bool,
    next_name: NativeObject,
}

/// Raster context that records calls instead of drawing.
///
/// Clones share one [`HeadlessState`].
#[derive(Debug, Default, Clone)]
pub struct HeadlessContext {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uniforms every linked program will report.
    pub fn with_uniforms(self, uniforms: Vec<ActiveUniform>) -> Self {
        self.state.lock().active_uniforms = uniforms;
        self
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.state.lock().fail_creates = fail;
    }

    pub fn snapshot(&self) -> HeadlessState {
        self.state.lock().clone()
    }

    fn record(&self, call: &str) {
        self.state.lock().calls.push(call.to_string());
    }

    fn create(&self, call: &str) -> Option<NativeObject> {
        let mut state = self.state.lock();
        state.calls.push(call.to_string());
        if state.fail_creates {
            return None;
        }
        state.next_name += 1;
        let name = 0x1000 + state.next_name;
        state.objects.insert(name);
        Some(name)
    }

    fn delete(&self, call: &str, name: NativeObject) {
        let mut state = self.state.lock();
        state.calls.push(call.to_string());
        state.objects.remove(&name);
    }

    /// Native location for element `index` of uniform `base`.
    fn location_of(program: NativeObject, uniform: usize, index: u32) -> NativeObject {
        (program << 32) | ((uniform as u64) << 16) | index as u64
    }
}

impl RasterContext for HeadlessContext {
    fn setup(&mut self, width: u32, height: u32) -> bool {
        let mut state = self.state.lock();
        state.calls.push(String::from("setup"));
        state.surface = Some((width, height));
        true
    }

    fn get_error(&mut self) -> u32 {
        self.record("getError");
        0
    }

    fn enable(&mut self, _cap: u32) {
        self.record("enable");
    }

    fn disable(&mut self, _cap: u32) {
        self.record("disable");
    }

    fn clear(&mut self, _mask: u32) {
        self.record("clear");
    }

    fn clear_color(&mut self, r: f32, g: f32, b: f32, a: f32) {
        let mut state = self.state.lock();
        state.calls.push(String::from("clearColor"));
        state.clear_color = [r, g, b, a];
    }

    fn viewport(&mut self, x: i32, y: i32, width: i32, height: i32) {
        let mut state = self.state.lock();
        state.calls.push(String::from("viewport"));
        state.viewport = [x, y, width, height];
    }

    fn create_program(&mut self) -> Option<NativeObject> {
        self.create("createProgram")
    }

    fn delete_program(&mut self, program: NativeObject) {
        self.delete("deleteProgram", program);
    }

    fn create_shader(&mut self, _kind: u32) -> Option<NativeObject> {
        self.create("createShader")
    }

    fn delete_shader(&mut self, shader: NativeObject) {
        self.delete("deleteShader", shader);
    }

    fn shader_source(&mut self, shader: NativeObject, source: &str) {
        let mut state = self.state.lock();
        state.calls.push(String::from("shaderSource"));
        state.sources.insert(shader, source.to_string());
    }

    fn compile_shader(&mut self, _shader: NativeObject) {
        self.record("compileShader");
    }

    fn shader_parameter(&mut self, _shader: NativeObject, param: u32) -> i32 {
        (param == GL_COMPILE_STATUS) as i32
    }

    fn shader_info_log(&mut self, _shader: NativeObject) -> String {
        String::new()
    }

    fn program_parameter(&mut self, _program: NativeObject, param: u32) -> i32 {
        (param == GL_LINK_STATUS) as i32
    }

    fn program_info_log(&mut self, _program: NativeObject) -> String {
        String::from("headless")
    }

    fn attach_shader(&mut self, _program: NativeObject, _shader: NativeObject) {
        self.record("attachShader");
    }

    fn link_program(&mut self, _program: NativeObject) {
        self.record("linkProgram");
    }

    fn use_program(&mut self, _program: Option<NativeObject>) {
        self.record("useProgram");
    }

    fn active_uniforms(&mut self, _program: NativeObject) -> Vec<ActiveUniform> {
        self.state.lock().active_uniforms.clone()
    }

    fn uniform_location(&mut self, program: NativeObject, name: &str) -> Option<NativeObject> {
        let (base, index) = split_array_suffix(name)?;
        let state = self.state.lock();
        state
            .active_uniforms
            .iter()
            .enumerate()
            .find(|(_, u)| split_array_suffix(&u.name).map(|(b, _)| b) == Some(base) && index < u.size)
            .map(|(i, _)| Self::location_of(program, i, index))
    }

    fn uniform_f(&mut self, location: Option<NativeObject>, values: &[f32]) {
        let mut state = self.state.lock();
        state.calls.push(String::from("uniformf"));
        if let Some(location) = location {
            state.uniform_values.insert(location, values.to_vec());
        }
    }

    fn uniform_i(&mut self, location: Option<NativeObject>, values: &[i32]) {
        let mut state = self.state.lock();
        state.calls.push(String::from("uniformi"));
        if let Some(location) = location {
            state
                .uniform_values
                .insert(location, values.iter().map(|&v| v as f32).collect());
        }
    }

    fn draw_arrays(&mut self, _mode: u32, _first: i32, _count: i32) {
        self.record("drawArrays");
    }

    fn create_texture(&mut self) -> Option<NativeObject> {
        self.create("createTexture")
    }

    fn delete_texture(&mut self, texture: NativeObject) {
        self.delete("deleteTexture", texture);
    }

    fn bind_texture(&mut self, _target: u32, _texture: Option<NativeObject>) {
        self.record("bindTexture");
    }

    fn active_texture(&mut self, _unit: u32) {
        self.record("activeTexture");
    }

    fn tex_image_2d(&mut self, upload: &TextureUpload<'_>) {
        let mut state = self.state.lock();
        state.calls.push(String::from("texImage2D"));
        let len = upload.pixels.map_or(0, <[u8]>::len);
        state.uploads.push((upload.width, upload.height, len));
    }

    fn generate_mipmap(&mut self, _target: u32) {
        self.record("generateMipmap");
    }
}

// ---------------------------------------------------------------------------
// Import bindings
// ---------------------------------------------------------------------------

/// Registers the GL imports. The session must carry a [`GraphicsLayer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GlBindings;

/// Run `call` against the session's graphics layer and memory.
fn with_gl<R>(
    caller: &mut Caller<'_, HostSession>,
    call: impl FnOnce(&mut GraphicsLayer, &mut GuestMemory<'_>) -> Result<R, HostFault>,
) -> wasmtime::Result<R> {
    let result = {
        let (mut memory, session) = guest_view(caller)?;
        match session.graphics.as_mut() {
            Some(gl) => call(gl, &mut memory),
            None => Err(HostFault::new(
                FaultCategory::Crash,
                "graphics call without a graphics layer",
            )),
        }
    };
    result.map_err(|fault| caller.data_mut().raise(fault))
}

/// Out-of-bounds guest pointer in a graphics call.
fn bad_pointer(call: &str) -> HostFault {
    HostFault::new(FaultCategory::Crash, format!("{}: pointer out of bounds", call))
}

/// Concatenate `count` shader source fragments.
fn read_source(memory: &GuestMemory<'_>, count: i32, strings_ptr: u32, lengths_ptr: u32) -> Option<String> {
    let mut source = String::new();
    for i in 0..count.max(0) as u32 {
        let ptr = memory.read_u32(strings_ptr.checked_add(i.checked_mul(4)?)?).ok()?;
        let len = match lengths_ptr {
            0 => None,
            lengths => {
                let len = memory.read_u32(lengths.checked_add(i.checked_mul(4)?)?).ok()? as i32;
                (len >= 0).then_some(len as u32)
            }
        };
        source.push_str(&strings::decode(memory.as_slice(), ptr, len));
    }
    Some(source)
}

/// Write an info log the way `glGet*InfoLog` does.
fn write_info_log(memory: &mut GuestMemory<'_>, log: &str, buf_size: i32, length_ptr: u32, buf_ptr: u32) -> Result<(), HostFault> {
    let written = strings::encode(memory.as_mut_slice(), log, buf_ptr, Some(buf_size.max(0) as u32));
    if length_ptr != 0 {
        memory
            .write_u32(length_ptr, written)
            .map_err(|_| bad_pointer("info log"))?;
    }
    Ok(())
}

impl ImportExtension for GlBindings {
    fn register(&self, linker: &mut Linker<HostSession>) -> wasmtime::Result<()> {
        linker.func_wrap(
            ENV_MODULE,
            "wajsSetupGlContext",
            |mut caller: Caller<'_, HostSession>, width: i32, height: i32, callback: i32| -> wasmtime::Result<()> {
                let session = caller.data_mut();
                let ready = match session.graphics.as_mut() {
                    Some(gl) => gl.context_mut().setup(width.max(0) as u32, height.max(0) as u32),
                    None => {
                        let fault = HostFault::new(FaultCategory::Crash, "graphics call without a graphics layer");
                        return Err(session.raise(fault));
                    }
                };
                if !ready {
                    log::warn!("[wajs:gl] could not create a context");
                    return Ok(());
                }
                session.hooks.main_loop = Some(callback as u32);
                session.hooks.update_frame_time = true;
                log::info!("[wajs:gl] context {}x{}, frame callback table[{}]", width, height, callback);
                Ok(())
            },
        )?;

        linker.func_wrap(ENV_MODULE, "glGetError", |mut caller: Caller<'_, HostSession>| {
            with_gl(&mut caller, |gl, _| Ok(gl.context_mut().get_error() as i32))
        })?;
        linker.func_wrap(ENV_MODULE, "glEnable", |mut caller: Caller<'_, HostSession>, cap: i32| {
            with_gl(&mut caller, |gl, _| {
                gl.context_mut().enable(cap as u32);
                Ok(())
            })
        })?;
        linker.func_wrap(ENV_MODULE, "glDisable", |mut caller: Caller<'_, HostSession>, cap: i32| {
            with_gl(&mut caller, |gl, _| {
                gl.context_mut().disable(cap as u32);
                Ok(())
            })
        })?;
        linker.func_wrap(ENV_MODULE, "glClear", |mut caller: Caller<'_, HostSession>, mask: i32| {
            with_gl(&mut caller, |gl, _| {
                gl.context_mut().clear(mask as u32);
                Ok(())
            })
        })?;
        linker.func_wrap(
            ENV_MODULE,
            "glClearColor",
            |mut caller: Caller<'_, HostSession>, r: f32, g: f32, b: f32, a: f32| {
                with_gl(&mut caller, |gl, _| {
                    gl.context_mut().clear_color(r, g, b, a);
                    Ok(())
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glViewport",
            |mut caller: Caller<'_, HostSession>, x: i32, y: i32, w: i32, h: i32| {
                with_gl(&mut caller, |gl, _| {
                    gl.context_mut().viewport(x, y, w, h);
                    Ok(())
                })
            },
        )?;

        // Programs and shaders
        linker.func_wrap(ENV_MODULE, "glCreateProgram", |mut caller: Caller<'_, HostSession>| {
            with_gl(&mut caller, |gl, _| gl.create_program().map(|id| id as i32))
        })?;
        linker.func_wrap(ENV_MODULE, "glDeleteProgram", |mut caller: Caller<'_, HostSession>, program: i32| {
            with_gl(&mut caller, |gl, _| {
                gl.delete_program(program as u32);
                Ok(())
            })
        })?;
        linker.func_wrap(ENV_MODULE, "glCreateShader", |mut caller: Caller<'_, HostSession>, kind: i32| {
            with_gl(&mut caller, |gl, _| gl.create_shader(kind as u32).map(|id| id as i32))
        })?;
        linker.func_wrap(ENV_MODULE, "glDeleteShader", |mut caller: Caller<'_, HostSession>, shader: i32| {
            with_gl(&mut caller, |gl, _| {
                gl.delete_shader(shader as u32);
                Ok(())
            })
        })?;
        linker.func_wrap(
            ENV_MODULE,
            "glShaderSource",
            |mut caller: Caller<'_, HostSession>, shader: i32, count: i32, strings_ptr: i32, lengths_ptr: i32| {
                with_gl(&mut caller, |gl, memory| {
                    let source = read_source(memory, count, strings_ptr as u32, lengths_ptr as u32)
                        .ok_or_else(|| bad_pointer("glShaderSource"))?;
                    gl.shader_source(shader as u32, &source);
                    Ok(())
                })
            },
        )?;
        linker.func_wrap(ENV_MODULE, "glCompileShader", |mut caller: Caller<'_, HostSession>, shader: i32| {
            with_gl(&mut caller, |gl, _| {
                gl.compile_shader(shader as u32);
                Ok(())
            })
        })?;
        linker.func_wrap(
            ENV_MODULE,
            "glGetShaderiv",
            |mut caller: Caller<'_, HostSession>, shader: i32, param: i32, out: i32| {
                with_gl(&mut caller, |gl, memory| {
                    let value = gl.shader_iv(shader as u32, param as u32);
                    memory
                        .write_u32(out as u32, value as u32)
                        .map_err(|_| bad_pointer("glGetShaderiv"))
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glGetShaderInfoLog",
            |mut caller: Caller<'_, HostSession>, shader: i32, buf_size: i32, length: i32, buf: i32| {
                with_gl(&mut caller, |gl, memory| {
                    let log = gl.shader_info_log(shader as u32);
                    write_info_log(memory, &log, buf_size, length as u32, buf as u32)
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glGetProgramiv",
            |mut caller: Caller<'_, HostSession>, program: i32, param: i32, out: i32| {
                with_gl(&mut caller, |gl, memory| {
                    let value = gl.program_iv(program as u32, param as u32);
                    memory
                        .write_u32(out as u32, value as u32)
                        .map_err(|_| bad_pointer("glGetProgramiv"))
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glGetProgramInfoLog",
            |mut caller: Caller<'_, HostSession>, program: i32, buf_size: i32, length: i32, buf: i32| {
                with_gl(&mut caller, |gl, memory| {
                    let log = gl.program_info_log(program as u32);
                    write_info_log(memory, &log, buf_size, length as u32, buf as u32)
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glAttachShader",
            |mut caller: Caller<'_, HostSession>, program: i32, shader: i32| {
                with_gl(&mut caller, |gl, _| {
                    gl.attach_shader(program as u32, shader as u32);
                    Ok(())
                })
            },
        )?;
        linker.func_wrap(ENV_MODULE, "glLinkProgram", |mut caller: Caller<'_, HostSession>, program: i32| {
            with_gl(&mut caller, |gl, _| {
                gl.link_program(program as u32);
                Ok(())
            })
        })?;
        linker.func_wrap(ENV_MODULE, "glUseProgram", |mut caller: Caller<'_, HostSession>, program: i32| {
            with_gl(&mut caller, |gl, _| {
                gl.use_program(program as u32);
                Ok(())
            })
        })?;

        // Uniforms
        linker.func_wrap(
            ENV_MODULE,
            "glGetUniformLocation",
            |mut caller: Caller<'_, HostSession>, program: i32, name: i32| {
                with_gl(&mut caller, |gl, memory| {
                    let name = strings::decode(memory.as_slice(), name as u32, None);
                    Ok(gl.uniform_location(program as u32, &name))
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glUniform1f",
            |mut caller: Caller<'_, HostSession>, location: i32, v0: f32| {
                with_gl(&mut caller, |gl, _| {
                    gl.uniform_f(location, &[v0]);
                    Ok(())
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glUniform1i",
            |mut caller: Caller<'_, HostSession>, location: i32, v0: i32| {
                with_gl(&mut caller, |gl, _| {
                    gl.uniform_i(location, &[v0]);
                    Ok(())
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glUniform2f",
            |mut caller: Caller<'_, HostSession>, location: i32, v0: f32, v1: f32| {
                with_gl(&mut caller, |gl, _| {
                    gl.uniform_f(location, &[v0, v1]);
                    Ok(())
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glUniform3f",
            |mut caller: Caller<'_, HostSession>, location: i32, v0: f32, v1: f32, v2: f32| {
                with_gl(&mut caller, |gl, _| {
                    gl.uniform_f(location, &[v0, v1, v2]);
                    Ok(())
                })
            },
        )?;

        linker.func_wrap(
            ENV_MODULE,
            "glDrawArrays",
            |mut caller: Caller<'_, HostSession>, mode: i32, first: i32, count: i32| {
                with_gl(&mut caller, |gl, _| {
                    gl.context_mut().draw_arrays(mode as u32, first, count);
                    Ok(())
                })
            },
        )?;

        // Textures
        linker.func_wrap(
            ENV_MODULE,
            "glGenTextures",
            |mut caller: Caller<'_, HostSession>, n: i32, textures: i32| {
                with_gl(&mut caller, |gl, memory| {
                    let ids = gl.gen_textures(n.max(0) as u32)?;
                    for (i, id) in ids.into_iter().enumerate() {
                        let slot = (textures as u32).wrapping_add(i as u32 * 4);
                        memory
                            .write_u32(slot, id)
                            .map_err(|_| bad_pointer("glGenTextures"))?;
                    }
                    Ok(())
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glDeleteTextures",
            |mut caller: Caller<'_, HostSession>, n: i32, textures: i32| {
                with_gl(&mut caller, |gl, memory| {
                    for i in 0..n.max(0) as u32 {
                        let slot = (textures as u32).wrapping_add(i * 4);
                        let id = memory
                            .read_u32(slot)
                            .map_err(|_| bad_pointer("glDeleteTextures"))?;
                        gl.delete_texture(id);
                    }
                    Ok(())
                })
            },
        )?;
        linker.func_wrap(
            ENV_MODULE,
            "glBindTexture",
            |mut caller: Caller<'_, HostSession>, target: i32, texture: i32| {
                with_gl(&mut caller, |gl, _| {
                    gl.bind_texture(target as u32, texture as u32);
                    Ok(())
                })
            },
        )?;
        linker.func_wrap(ENV_MODULE, "glActiveTexture", |mut caller: Caller<'_, HostSession>, unit: i32| {
            with_gl(&mut caller, |gl, _| {
                gl.context_mut().active_texture(unit as u32);
                Ok(())
            })
        })?;
        linker.func_wrap(
            ENV_MODULE,
            "glTexImage2D",
            |mut caller: Caller<'_, HostSession>,
             target: i32,
             level: i32,
             internal_format: i32,
             width: i32,
             height: i32,
             border: i32,
             format: i32,
             ty: i32,
             data: i32| {
                with_gl(&mut caller, |gl, memory| {
                    let pixels = match (data, pixel_data_size(format as u32, ty as u32, width, height)) {
                        (0, _) => None,
                        (_, None) => {
                            log::error!("[wajs:gl] invalid pixel format {:#x}/{:#x}", format, ty);
                            None
                        }
                        (ptr, Some(len)) => Some(
                            memory
                                .read_bytes(ptr as u32, len)
                                .map_err(|_| bad_pointer("glTexImage2D"))?,
                        ),
                    };
                    gl.context_mut().tex_image_2d(&TextureUpload {
                        target: target as u32,
                        level,
                        internal_format,
                        width,
                        height,
                        border,
                        format: format as u32,
                        ty: ty as u32,
                        pixels,
                    });
                    Ok(())
                })
            },
        )?;
        linker.func_wrap(ENV_MODULE, "glGenerateMipmap", |mut caller: Caller<'_, HostSession>, target: i32| {
            with_gl(&mut caller, |gl, _| {
                gl.context_mut().generate_mipmap(target as u32);
                Ok(())
            })
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_with(uniforms: Vec<ActiveUniform>) -> (GraphicsLayer, HeadlessContext) {
        let context = HeadlessContext::new().with_uniforms(uniforms);
        (GraphicsLayer::new(Box::new(context.clone())), context)
    }

    fn uniform(name: &str, size: u32) -> ActiveUniform {
        ActiveUniform {
            name: name.to_string(),
            size,
        }
    }

    #[test]
    fn test_pixel_data_size() {
        // RGBA bytes: rows are already aligned.
        assert_eq!(pixel_data_size(0x1908, 0x1401, 4, 4), Some(64));
        // RGB bytes, width 3: 9-byte rows padded to 12, last row unpadded.
        assert_eq!(pixel_data_size(0x1907, 0x1401, 3, 2), Some(12 + 9));
        // Float luminance.
        assert_eq!(pixel_data_size(0x1909, 0x1406, 5, 1), Some(20));
        // Packed 5_6_5, width 1: 2-byte rows padded to 4.
        assert_eq!(pixel_data_size(0x1907, 0x8363, 1, 3), Some(4 + 4 + 2));
        assert_eq!(pixel_data_size(0x1908, 0x1401, 4, 0), Some(0));
        assert_eq!(pixel_data_size(0xDEAD, 0x1401, 1, 1), None);
        assert_eq!(pixel_data_size(0x1908, 0xBEEF, 1, 1), None);
    }

    #[test]
    fn test_split_array_suffix() {
        assert_eq!(split_array_suffix("color"), Some(("color", 0)));
        assert_eq!(split_array_suffix("lights[3]"), Some(("lights", 3)));
        assert_eq!(split_array_suffix("lights[]"), Some(("lights", 0)));
        assert_eq!(split_array_suffix("lights[x]"), None);
    }

    #[test]
    fn test_object_ids_per_class() {
        let (mut gl, context) = layer_with(Vec::new());
        assert_eq!(gl.create_program().unwrap(), 1);
        assert_eq!(gl.create_shader(0x8B31).unwrap(), 1);
        assert_eq!(gl.create_shader(0x8B30).unwrap(), 2);
        assert_eq!(gl.gen_textures(3).unwrap(), vec![1, 2, 3]);

        gl.delete_texture(2);
        gl.delete_texture(2);
        assert_eq!(gl.texture_count(), 2);
        assert_eq!(gl.gen_textures(1).unwrap(), vec![4]);
        assert_eq!(context.snapshot().objects.len(), 6);
    }

    #[test]
    fn test_create_failure_is_fatal() {
        let (mut gl, context) = layer_with(Vec::new());
        context.set_fail_creates(true);
        let fault = gl.gen_textures(1).unwrap_err();
        assert_eq!(fault.category, FaultCategory::Crash);
        assert!(fault.message.starts_with("GL_INVALID_OPERATION"));
        assert!(gl.create_program().is_err());
    }

    #[test]
    fn test_uniform_table_after_link() {
        let (mut gl, _context) = layer_with(vec![uniform("time", 1), uniform("lights[0]", 3)]);
        let program = gl.create_program().unwrap();

        assert_eq!(gl.uniform_location(program, "time"), -1);
        gl.link_program(program);

        let time = gl.uniform_location(program, "time");
        let lights = gl.uniform_location(program, "lights");
        assert!(time > 0);
        assert_eq!(gl.uniform_location(program, "lights[0]"), lights);
        assert_eq!(gl.uniform_location(program, "lights[2]"), lights + 2);
        assert_eq!(gl.uniform_location(program, "lights[3]"), -1);
        assert_eq!(gl.uniform_location(program, "missing"), -1);
        assert_eq!(gl.max_uniform_length(program), 10);
    }

    #[test]
    fn test_relink_replaces_locations() {
        let (mut gl, context) = layer_with(vec![uniform("time", 1)]);
        let program = gl.create_program().unwrap();
        gl.link_program(program);
        let first = gl.uniform_location(program, "time");
        gl.link_program(program);
        let second = gl.uniform_location(program, "time");
        assert_ne!(first, second);

        gl.uniform_f(first, &[1.0]);
        gl.uniform_f(second, &[2.0]);
        let values: Vec<Vec<f32>> = context.snapshot().uniform_values.into_values().collect();
        assert_eq!(values, vec![vec![2.0]]);
    }

    #[test]
    fn test_shader_queries() {
        let (mut gl, context) = layer_with(Vec::new());
        let shader = gl.create_shader(0x8B31).unwrap();
        gl.shader_source(shader, "void main() {}");
        gl.compile_shader(shader);
        assert_eq!(gl.shader_iv(shader, GL_COMPILE_STATUS), 1);
        assert_eq!(gl.shader_iv(shader, GL_INFO_LOG_LENGTH), 0);
        assert_eq!(gl.shader_iv(99, GL_COMPILE_STATUS), 0);

        let program = gl.create_program().unwrap();
        assert_eq!(gl.program_iv(program, GL_INFO_LOG_LENGTH), 8);
        assert_eq!(gl.program_info_log(program), "headless");

        let state = context.snapshot();
        assert_eq!(state.sources.values().next().unwrap(), "void main() {}");
    }

    #[test]
    fn test_read_source_fragments() {
        let mut buf = vec![0u8; 256];
        let mut memory = GuestMemory::new(&mut buf);
        memory.write_bytes(100, b"void \0").unwrap();
        memory.write_bytes(120, b"main(){}xyz").unwrap();
        memory.write_u32(0, 100).unwrap();
        memory.write_u32(4, 120).unwrap();
        memory.write_u32(16, u32::MAX).unwrap(); // -1: NUL-terminated
        memory.write_u32(20, 8).unwrap();

        assert_eq!(read_source(&memory, 2, 0, 16).unwrap(), "void main(){}");
        assert_eq!(read_source(&memory, 1, 0, 0).unwrap(), "void ");
        assert!(read_source(&memory, 1, 300, 0).is_none());
    }
}
