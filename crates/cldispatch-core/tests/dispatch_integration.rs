//! End-to-end dispatch tests against the host reference driver

use cldispatch_core::{
    select_device, select_platform, AccessMode, Buffer, CommandQueue, Context, DeviceClass, DeviceRegistry,
    DispatchConfig, DispatchError, HostDeviceSpec, HostDriver, HostPlatformSpec, IndexSpace, Matrix, Program,
    Result, Session, TransferMode, MATRIX_MUL_SOURCE, VECTOR_ADD_SOURCE,
};

const SCALE_SOURCE: &str = r#"
__kernel void scale(__global float* x, const float factor) {
    int i = get_global_id(0);
    x[i] = x[i] * factor;
}
"#;

struct Fixture {
    queue: CommandQueue,
    ctx: Context,
    device: cldispatch_core::Device,
}

fn fixture_on(registry: &DeviceRegistry, device_index: usize) -> Result<Fixture> {
    let platform = select_platform(&registry.list_platforms()?, 0)?;
    let device = select_device(&registry.list_devices(&platform)?, device_index)?;
    let ctx = Context::new(&device)?;
    let queue = CommandQueue::new(&ctx)?;
    Ok(Fixture { queue, ctx, device })
}

fn fixture() -> Result<Fixture> {
    fixture_on(&DeviceRegistry::host(), 0)
}

#[test]
fn test_registry_lists_reference_devices() -> Result<()> {
    let registry = DeviceRegistry::host();
    let platforms = registry.list_platforms()?;
    assert_eq!(platforms.len(), 1);

    let devices = registry.list_devices(&platforms[0])?;
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].class(), DeviceClass::Cpu);
    assert_eq!(devices[1].class(), DeviceClass::Accelerator);
    assert!(devices.iter().all(|d| d.global_mem_size() > 0));
    Ok(())
}

#[test]
fn test_valid_device_selection() -> Result<()> {
    let registry = DeviceRegistry::host();
    let platform = select_platform(&registry.list_platforms()?, 0)?;
    let devices = registry.list_devices(&platform)?;
    for (index, expected) in devices.iter().enumerate() {
        assert_eq!(&select_device(&devices, index)?, expected);
    }
    Ok(())
}

#[test]
fn test_invalid_device_selection() -> Result<()> {
    let registry = DeviceRegistry::host();
    let platform = select_platform(&registry.list_platforms()?, 0)?;
    let devices = registry.list_devices(&platform)?;

    let err = select_device(&devices, devices.len()).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::InvalidSelection {
            what: "device",
            index: 2,
            available: 2
        }
    ));

    let err = select_platform(&registry.list_platforms()?, 1).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidSelection { what: "platform", .. }));
    Ok(())
}

#[test]
fn test_no_platform_found() {
    let registry = DeviceRegistry::new(HostDriver::empty());
    assert!(matches!(registry.list_platforms(), Err(DispatchError::NoPlatformFound)));
    assert!(matches!(
        Session::open(HostDriver::empty(), &DispatchConfig::default()),
        Err(DispatchError::NoPlatformFound)
    ));
}

#[test]
fn test_no_device_found() -> Result<()> {
    let driver = HostDriver::with_platforms(vec![HostPlatformSpec::reference().without_devices()]);
    let registry = DeviceRegistry::new(driver);
    let platform = select_platform(&registry.list_platforms()?, 0)?;
    assert!(matches!(
        registry.list_devices(&platform),
        Err(DispatchError::NoDeviceFound { .. })
    ));
    Ok(())
}

#[test]
fn test_upload_drain_download_roundtrip() -> Result<()> {
    let f = fixture()?;
    let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let buffer = Buffer::allocate(&f.ctx, data.len(), AccessMode::ReadWrite)?;

    f.queue.upload(&buffer, &data, TransferMode::Deferred)?;
    f.queue.drain()?;
    assert_eq!(f.queue.download::<u8>(&buffer, data.len())?, data);
    Ok(())
}

#[test]
fn test_vector_add_reference_values() -> Result<()> {
    let session = Session::open_host(&DispatchConfig::default())?;
    let a: Vec<i32> = (0..10).collect();
    let b = [0, 1, 2, 0, 1, 2, 0, 1, 2, 0];

    let c = session.vector_add(VECTOR_ADD_SOURCE, &a, &b)?;
    assert_eq!(c, vec![0, 2, 4, 3, 5, 7, 6, 8, 10, 9]);
    session.close()
}

#[test]
fn test_vector_add_on_every_device() -> Result<()> {
    for device in 0..2 {
        let session = Session::open_host(&DispatchConfig::default().with_device(device))?;
        assert_eq!(session.device(), session.context().device());
        let c = session.vector_add(VECTOR_ADD_SOURCE, &[1, -1, 7], &[2, 1, -7])?;
        assert_eq!(c, vec![3, 0, 0]);
    }
    Ok(())
}

#[test]
fn test_matmul_identity() -> Result<()> {
    let session = Session::open_host(&DispatchConfig::default())?;
    let a = Matrix::new(2, 2, vec![1.0, 0.0, 0.0, 1.0])?;
    let b = Matrix::new(2, 2, vec![5.0, 6.0, 7.0, 8.0])?;

    let c = session.matmul(MATRIX_MUL_SOURCE, &a, &b)?;
    assert_eq!(c.data(), &[5.0, 6.0, 7.0, 8.0]);
    Ok(())
}

#[test]
fn test_matmul_non_square() -> Result<()> {
    let session = Session::open_host(&DispatchConfig::default())?;
    // 1x3 times 3x2
    let a = Matrix::new(1, 3, vec![1.0, 2.0, 3.0])?;
    let b = Matrix::new(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0])?;

    let c = session.matmul(MATRIX_MUL_SOURCE, &a, &b)?;
    assert_eq!((c.rows(), c.cols()), (1, 2));
    assert_eq!(c.data(), &[4.0, 5.0]);
    Ok(())
}

#[test]
fn test_dimension_mismatch_issues_no_work() -> Result<()> {
    let f = fixture()?;
    let program = Program::build(&f.ctx, MATRIX_MUL_SOURCE, &f.device)?;
    let mut kernel = program.extract_kernel("matrixMul")?;
    assert_eq!(kernel.dimensions(), 2);

    let c = Buffer::allocate_for::<f32>(&f.ctx, 4, AccessMode::WriteOnly)?;
    let a = Buffer::allocate_for::<f32>(&f.ctx, 4, AccessMode::ReadOnly)?;
    let b = Buffer::allocate_for::<f32>(&f.ctx, 4, AccessMode::ReadOnly)?;
    f.queue.upload(&c, &[-1.0f32; 4], TransferMode::Blocking)?;
    kernel.set_arg(0, &c)?;
    kernel.set_arg(1, &a)?;
    kernel.set_arg(2, &b)?;
    kernel.set_arg(3, 2i32)?;
    kernel.set_arg(4, 2i32)?;

    let before = f.queue.stats();
    let err = f.queue.submit(&kernel, IndexSpace::linear(4)).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::DimensionMismatch {
            expected: 2,
            actual: 1,
            ..
        }
    ));
    assert_eq!(f.queue.stats(), before);

    f.queue.drain()?;
    assert_eq!(f.queue.download::<f32>(&c, 4)?, vec![-1.0; 4]);
    Ok(())
}

#[test]
fn test_invalid_source_build_log() -> Result<()> {
    let f = fixture()?;

    let err = Program::build(&f.ctx, "__kernel void broken(__global int* a { a[0] = 1; }", &f.device).unwrap_err();
    let log = err.build_log().unwrap_or_default();
    assert!(!log.is_empty());
    assert!(log.contains("error"), "{log}");

    let err = Program::build(&f.ctx, "", &f.device).unwrap_err();
    assert!(matches!(err, DispatchError::BuildFailed { ref log } if !log.is_empty()));

    let err = Program::build(&f.ctx, "int helper(int x) { return x; }", &f.device).unwrap_err();
    assert!(matches!(err, DispatchError::BuildFailed { ref log } if !log.is_empty()));
    Ok(())
}

#[test]
fn test_unregistered_kernel_fails_build() -> Result<()> {
    let f = fixture()?;
    let err = Program::build(&f.ctx, SCALE_SOURCE, &f.device).unwrap_err();
    assert_eq!(
        err.build_log(),
        Some("error: no host routine registered for kernel 'scale'")
    );
    Ok(())
}

#[test]
fn test_idempotent_resubmission() -> Result<()> {
    let session = Session::open_host(&DispatchConfig::default())?;
    let a: Vec<i32> = (0..64).collect();
    let b: Vec<i32> = (0..64).rev().collect();

    let first = session.vector_add(VECTOR_ADD_SOURCE, &a, &b)?;
    let second = session.vector_add(VECTOR_ADD_SOURCE, &a, &b)?;
    assert_eq!(first, second);
    assert!(first.iter().all(|&v| v == 63));

    let f = fixture()?;
    let program = Program::build(&f.ctx, VECTOR_ADD_SOURCE, &f.device)?;
    let mut kernel = program.extract_kernel("simple_add")?;
    let ba = Buffer::allocate_for::<i32>(&f.ctx, a.len(), AccessMode::ReadOnly)?;
    let bb = Buffer::allocate_for::<i32>(&f.ctx, b.len(), AccessMode::ReadOnly)?;
    let bc = Buffer::allocate_for::<i32>(&f.ctx, a.len(), AccessMode::WriteOnly)?;
    f.queue.upload(&ba, &a, TransferMode::Blocking)?;
    f.queue.upload(&bb, &b, TransferMode::Blocking)?;
    kernel.set_arg(0, &ba)?;
    kernel.set_arg(1, &bb)?;
    kernel.set_arg(2, &bc)?;

    f.queue.submit(&kernel, IndexSpace::linear(a.len()))?;
    f.queue.drain()?;
    let once = f.queue.download::<i32>(&bc, a.len())?;
    f.queue.submit(&kernel, IndexSpace::linear(a.len()))?;
    f.queue.drain()?;
    assert_eq!(f.queue.download::<i32>(&bc, a.len())?, once);
    assert_eq!(f.queue.stats().launches, 2);
    Ok(())
}

#[test]
fn test_kernel_not_found() -> Result<()> {
    let f = fixture()?;
    let program = Program::build(&f.ctx, VECTOR_ADD_SOURCE, &f.device)?;
    let err = program.extract_kernel("simple_sub").unwrap_err();
    assert!(matches!(err, DispatchError::KernelNotFound { ref name, .. } if name == "simple_sub"));
    Ok(())
}

#[test]
fn test_argument_binding_errors() -> Result<()> {
    let f = fixture()?;
    let program = Program::build(&f.ctx, MATRIX_MUL_SOURCE, &f.device)?;
    let mut kernel = program.extract_kernel("matrixMul")?;
    let buffer = Buffer::allocate_for::<f32>(&f.ctx, 4, AccessMode::ReadWrite)?;

    assert!(matches!(
        kernel.set_arg(5, 1i32),
        Err(DispatchError::InvalidArgumentPosition {
            position: 5,
            arity: 5,
            ..
        })
    ));
    // scalar into a buffer slot
    assert!(matches!(kernel.set_arg(0, 1i32), Err(DispatchError::TypeMismatch { .. })));
    // buffer into a scalar slot
    assert!(matches!(kernel.set_arg(3, &buffer), Err(DispatchError::TypeMismatch { .. })));
    // 8-byte value into an `int`
    assert!(matches!(kernel.set_arg(3, 2i64), Err(DispatchError::TypeMismatch { .. })));

    kernel.set_arg(0, &buffer)?;
    kernel.set_arg(1, &buffer)?;
    kernel.set_arg(2, &buffer)?;
    kernel.set_arg(3, 2i32)?;
    let err = f.queue.submit(&kernel, IndexSpace::grid(2, 2)).unwrap_err();
    assert!(matches!(err, DispatchError::UnboundArgument { position: 4, .. }));
    assert_eq!(f.queue.stats().launches, 0);
    Ok(())
}

#[test]
fn test_zero_index_space_rejected() -> Result<()> {
    let f = fixture()?;
    let program = Program::build(&f.ctx, VECTOR_ADD_SOURCE, &f.device)?;
    let kernel = program.extract_kernel("simple_add")?;
    assert!(matches!(
        f.queue.submit(&kernel, IndexSpace::linear(0)),
        Err(DispatchError::InvalidIndexSpace(_))
    ));
    Ok(())
}

#[test]
fn test_bounds_violation_before_device_work() -> Result<()> {
    let f = fixture()?;
    let buffer = Buffer::allocate(&f.ctx, 16, AccessMode::ReadWrite)?;

    let err = f.queue.upload(&buffer, &[0u8; 17], TransferMode::Blocking).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::BoundsViolation {
            offset: 0,
            size: 17,
            buffer_size: 16
        }
    ));
    assert!(matches!(
        f.queue.upload_at(&buffer, 12, &[0u32; 2], TransferMode::Deferred),
        Err(DispatchError::BoundsViolation { offset: 12, .. })
    ));
    assert!(matches!(
        f.queue.download::<u32>(&buffer, 5),
        Err(DispatchError::BoundsViolation { .. })
    ));
    assert_eq!(f.queue.stats().submitted, 0);
    Ok(())
}

#[test]
fn test_offset_transfers() -> Result<()> {
    let f = fixture()?;
    let buffer = Buffer::allocate_for::<u32>(&f.ctx, 4, AccessMode::ReadWrite)?;
    f.queue.upload(&buffer, &[0u32; 4], TransferMode::Blocking)?;
    f.queue.upload_at(&buffer, 8, &[7u32, 9], TransferMode::Blocking)?;

    assert_eq!(f.queue.download::<u32>(&buffer, 4)?, vec![0, 0, 7, 9]);
    assert_eq!(f.queue.download_at::<u32>(&buffer, 12, 1)?, vec![9]);
    Ok(())
}

#[test]
fn test_allocation_failed() -> Result<()> {
    let driver = HostDriver::with_platforms(vec![HostPlatformSpec {
        devices: vec![HostDeviceSpec::cpu().with_memory(64)],
        ..HostPlatformSpec::reference()
    }]);
    let f = fixture_on(&DeviceRegistry::new(driver), 0)?;

    assert!(matches!(
        Buffer::allocate(&f.ctx, 0, AccessMode::ReadWrite),
        Err(DispatchError::AllocationFailed { requested: 0, .. })
    ));
    assert!(matches!(
        Buffer::allocate(&f.ctx, 65, AccessMode::ReadWrite),
        Err(DispatchError::AllocationFailed { requested: 65, .. })
    ));
    let _whole = Buffer::allocate(&f.ctx, 64, AccessMode::ReadWrite)?;
    Ok(())
}

#[test]
fn test_deferred_read_requires_covering_barrier() -> Result<()> {
    let f = fixture()?;
    let buffer = Buffer::allocate_for::<i32>(&f.ctx, 3, AccessMode::ReadWrite)?;
    f.queue.upload(&buffer, &[4, 5, 6], TransferMode::Deferred)?;

    let stale = f.queue.drain()?;
    let pending = f.queue.download_deferred::<i32>(&buffer, 3)?;
    assert!(stale.sequence() < pending.sequence());
    let err = pending.wait(&stale).unwrap_err();
    assert!(matches!(err, DispatchError::TransferPending { .. }));

    let pending = f.queue.download_deferred::<i32>(&buffer, 3)?;
    let barrier = f.queue.drain()?;
    assert!(pending.is_complete());
    assert_eq!(pending.wait(&barrier)?, vec![4, 5, 6]);
    Ok(())
}

#[test]
fn test_barrier_from_other_queue_rejected() -> Result<()> {
    let f = fixture()?;
    let other = CommandQueue::new(&f.ctx)?;
    let buffer = Buffer::allocate_for::<i32>(&f.ctx, 1, AccessMode::ReadWrite)?;
    f.queue.upload(&buffer, &[1], TransferMode::Blocking)?;

    let pending = f.queue.download_deferred::<i32>(&buffer, 1)?;
    f.queue.drain()?;
    let foreign = other.drain()?;
    assert!(matches!(pending.wait(&foreign), Err(DispatchError::TransferPending { .. })));
    Ok(())
}

#[test]
fn test_context_required_after_release() -> Result<()> {
    let f = fixture()?;
    let program = Program::build(&f.ctx, VECTOR_ADD_SOURCE, &f.device)?;
    let kernel = program.extract_kernel("simple_add")?;
    let buffer = Buffer::allocate_for::<i32>(&f.ctx, 4, AccessMode::ReadWrite)?;

    let Fixture { queue, ctx, .. } = f;
    ctx.release();

    assert!(matches!(
        queue.upload(&buffer, &[1i32; 4], TransferMode::Blocking),
        Err(DispatchError::ContextRequired { .. })
    ));
    assert!(matches!(queue.drain(), Err(DispatchError::ContextRequired { .. })));
    assert!(matches!(
        program.extract_kernel("simple_add"),
        Err(DispatchError::ContextRequired { .. })
    ));
    drop(kernel);
    Ok(())
}

#[test]
fn test_foreign_context_resources_rejected() -> Result<()> {
    let first = fixture()?;
    let second = fixture()?;
    let buffer = Buffer::allocate_for::<i32>(&first.ctx, 2, AccessMode::ReadWrite)?;

    assert!(matches!(
        second.queue.upload(&buffer, &[1i32, 2], TransferMode::Blocking),
        Err(DispatchError::ContextMismatch { .. })
    ));

    let program = Program::build(&second.ctx, VECTOR_ADD_SOURCE, &second.device)?;
    let mut kernel = program.extract_kernel("simple_add")?;
    assert!(matches!(kernel.set_arg(0, &buffer), Err(DispatchError::ContextMismatch { .. })));
    Ok(())
}

#[test]
fn test_registered_routine_dispatch() -> Result<()> {
    let driver = HostDriver::new();
    driver.register_routine("scale", |item, frame| {
        let i = item.global_id[0];
        let factor: f32 = frame.scalar(1)?;
        let x: f32 = frame.load(0, i)?;
        frame.store(0, i, x * factor)
    });
    let f = fixture_on(&DeviceRegistry::new(driver), 1)?;

    let program = Program::build(&f.ctx, SCALE_SOURCE, &f.device)?;
    let mut kernel = program.extract_kernel("scale")?;
    let buffer = Buffer::allocate_for::<f32>(&f.ctx, 3, AccessMode::ReadWrite)?;
    f.queue.upload(&buffer, &[1.0f32, 2.0, 3.0], TransferMode::Deferred)?;
    kernel.set_arg(0, &buffer)?;
    kernel.set_arg(1, 2.5f32)?;

    f.queue.submit(&kernel, IndexSpace::linear(3))?;
    let pending = f.queue.download_deferred::<f32>(&buffer, 3)?;
    let barrier = f.queue.drain()?;
    assert_eq!(pending.wait(&barrier)?, vec![2.5, 5.0, 7.5]);
    Ok(())
}

#[test]
fn test_build_options_from_config() -> Result<()> {
    let config = DispatchConfig::from_json_str(r#"{ "build_options": "-cl-fast-relaxed-math" }"#)?;
    let session = Session::open_host(&config)?;
    let program = session.build(VECTOR_ADD_SOURCE)?;
    assert_eq!(program.options(), "-cl-fast-relaxed-math");
    assert_eq!(program.kernel_names(), vec!["simple_add"]);
    Ok(())
}

#[test]
fn test_dropping_buffer_keeps_other_deferred_uploads() -> Result<()> {
    let f = fixture()?;
    let a = Buffer::allocate_for::<i32>(&f.ctx, 2, AccessMode::ReadWrite)?;
    let b = Buffer::allocate_for::<i32>(&f.ctx, 2, AccessMode::ReadWrite)?;
    f.queue.upload(&a, &[1i32, 2], TransferMode::Deferred)?;
    f.queue.upload(&b, &[3i32, 4], TransferMode::Deferred)?;

    drop(a);
    f.queue.drain()?;
    assert_eq!(f.queue.download::<i32>(&b, 2)?, vec![3, 4]);
    Ok(())
}

#[test]
fn test_macro_kernel_qualifier_dispatches() -> Result<()> {
    let source = r#"
#define KERNEL __kernel
KERNEL void simple_add(__global const int* A, __global const int* B, __global int* C) {
    int i = get_global_id(0);
    C[i] = A[i] + B[i];
}
"#;
    let session = Session::open_host(&DispatchConfig::default())?;
    assert_eq!(session.vector_add(source, &[1, 2, 3], &[10, 20, 30])?, vec![11, 22, 33]);
    Ok(())
}

#[test]
fn test_typedef_by_value_parameter() -> Result<()> {
    let source = r#"
typedef int myint;
__kernel void offset(__global int* x, myint delta) {
    int i = get_global_id(0);
    x[i] = x[i] + delta + (int)get_global_id(3);
}
"#;
    let driver = HostDriver::new();
    driver.register_routine("offset", |item, frame| {
        let i = item.global_id[0];
        let delta: i32 = frame.scalar(1)?;
        let x: i32 = frame.load(0, i)?;
        frame.store(0, i, x + delta)
    });
    let f = fixture_on(&DeviceRegistry::new(driver), 0)?;

    let program = Program::build(&f.ctx, source, &f.device)?;
    let mut kernel = program.extract_kernel("offset")?;
    assert_eq!(kernel.dimensions(), 1);
    let buffer = Buffer::allocate_for::<i32>(&f.ctx, 2, AccessMode::ReadWrite)?;
    f.queue.upload(&buffer, &[5i32, 6], TransferMode::Blocking)?;
    kernel.set_arg(0, &buffer)?;
    assert!(matches!(kernel.set_arg(1, 1i64), Err(DispatchError::TypeMismatch { .. })));
    kernel.set_arg(1, 3i32)?;

    f.queue.submit(&kernel, IndexSpace::linear(2))?;
    f.queue.drain()?;
    assert_eq!(f.queue.download::<i32>(&buffer, 2)?, vec![8, 9]);
    Ok(())
}
