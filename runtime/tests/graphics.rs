//! GL bindings driven by a real module against the headless context.

use wajs_runtime::host_gl::{ActiveUniform, HeadlessContext};
use wajs_runtime::session::CaptureSink;
use wajs_runtime::{FaultCategory, ModuleHost, RuntimeConfig, RuntimeError};

const SCENE: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (import "env" "wajsSetupGlContext" (func $setup (param i32 i32 i32)))
  (import "env" "glCreateProgram" (func $create_program (result i32)))
  (import "env" "glCreateShader" (func $create_shader (param i32) (result i32)))
  (import "env" "glShaderSource" (func $shader_source (param i32 i32 i32 i32)))
  (import "env" "glCompileShader" (func $compile (param i32)))
  (import "env" "glAttachShader" (func $attach (param i32 i32)))
  (import "env" "glLinkProgram" (func $link (param i32)))
  (import "env" "glUseProgram" (func $use (param i32)))
  (import "env" "glGetUniformLocation" (func $uniform_location (param i32 i32) (result i32)))
  (import "env" "glUniform1f" (func $uniform1f (param i32 f32)))
  (import "env" "glClear" (func $clear (param i32)))
  (table (export "__indirect_function_table") 1 funcref)
  (elem (i32.const 0) $frame)
  ;; source pointer table at 96, source at 128, uniform name at 192
  (data (i32.const 96) "\80\00\00\00")
  (data (i32.const 128) "void main() {}\00")
  (data (i32.const 192) "u_time\00")
  (func $frame
    (call $uniform1f (i32.load (i32.const 1028)) (f32.const 1.5))
    (call $clear (i32.const 0x4000)))
  (func (export "__wajsUpdateFrameTime")
    (i32.store (i32.const 1032) (i32.add (i32.load (i32.const 1032)) (i32.const 1))))
  (func (export "_start") (local $program i32) (local $shader i32)
    (local.set $program (call $create_program))
    (local.set $shader (call $create_shader (i32.const 0x8B31)))
    (call $shader_source (local.get $shader) (i32.const 1) (i32.const 96) (i32.const 0))
    (call $compile (local.get $shader))
    (call $attach (local.get $program) (local.get $shader))
    (call $link (local.get $program))
    (call $use (local.get $program))
    (i32.store (i32.const 1024) (local.get $program))
    (i32.store (i32.const 1028) (call $uniform_location (local.get $program) (i32.const 192)))
    (call $setup (i32.const 640) (i32.const 480) (i32.const 0))))
"#;

fn read_u32(host: &ModuleHost, offset: usize) -> u32 {
    let bytes = &host.memory_data()[offset..offset + 4];
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn headless() -> HeadlessContext {
    HeadlessContext::new().with_uniforms(vec![ActiveUniform {
        name: String::from("u_time"),
        size: 1,
    }])
}

#[test]
fn test_scene_setup_and_frames() {
    let context = headless();
    let sink = CaptureSink::new();
    let mut host = ModuleHost::builder(RuntimeConfig::default())
        .sink(sink.clone())
        .graphics(context.clone())
        .load(&wat::parse_str(SCENE).unwrap())
        .unwrap();
    host.start().unwrap();

    let state = context.snapshot();
    assert_eq!(state.surface, Some((640, 480)));
    assert!(state.sources.values().any(|s| s == "void main() {}"));
    assert_eq!(read_u32(&host, 1024), 1);
    let location = read_u32(&host, 1028) as i32;
    assert!(location > 0);
    assert!(host.session().hooks().update_frame_time);

    assert!(host.run_frame().unwrap());
    assert!(host.run_frame().unwrap());
    assert_eq!(read_u32(&host, 1032), 2);

    let state = context.snapshot();
    assert_eq!(state.calls.iter().filter(|c| *c == "clear").count(), 2);
    assert!(state.uniform_values.values().any(|v| v == &vec![1.5]));
    assert!(sink.errors().is_empty());
}

#[test]
fn test_failed_create_is_crash() {
    let context = headless();
    context.set_fail_creates(true);
    let sink = CaptureSink::new();
    let mut host = ModuleHost::builder(RuntimeConfig::default())
        .sink(sink.clone())
        .graphics(context)
        .load(&wat::parse_str(SCENE).unwrap())
        .unwrap();

    match host.start() {
        Err(RuntimeError::Fault(fault)) => assert_eq!(fault.category, FaultCategory::Crash),
        other => panic!("expected a CRASH fault, got {:?}", other),
    }
    assert!(!host.run_frame().unwrap());
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].1.starts_with("GL_INVALID_OPERATION"));
}

#[test]
fn test_gl_imports_need_graphics() {
    let sink = CaptureSink::new();
    let result = ModuleHost::builder(RuntimeConfig::default())
        .sink(sink.clone())
        .load(&wat::parse_str(SCENE).unwrap());
    assert!(matches!(result, Err(RuntimeError::Fault(_))));
    assert_eq!(sink.errors()[0].0, FaultCategory::Boot);
}
