//! Integration tests for metadata images

use gcmeta::{
    verify_image, ArgInfo, ArgsSize, FuncdataSlot, ImageError, InlineTree, MetadataImage,
    OpenCodedDeferInfo, ParamKind, PcdataChannel, Prototype, RoutineBuilder, RoutineDecl,
    StackObjects, Target, VerifyError, PROTOCOL_VERSION,
};

fn full_function(target: Target) -> gcmeta::FuncRecord {
    let ptr = target.ptr_bytes();
    let proto = Prototype::new(
        vec![ParamKind::Pointer, ParamKind::parse("slice").unwrap()],
        vec![ParamKind::Word],
    );
    let mut decl = RoutineDecl::new("·append", 0x1000, 64);
    decl.args_size = ArgsSize::Known(proto.args_size(ptr));
    decl.frame_size = 6 * ptr;

    let mut tree = InlineTree::new();
    tree.push("grow", 8, 120);

    let mut objects = StackObjects::new();
    objects.push(-(4 * ptr as i32), 2 * ptr, ptr, &[0]);

    let defer = OpenCodedDeferInfo {
        defer_bits_offset: 1,
        slots_offset: 2 * ptr,
    };

    let mut builder = RoutineBuilder::new(decl, target).with_prototype(proto);
    builder.no_local_pointers(0).unwrap();
    builder
        .funcdata(0, FuncdataSlot::InlTree, tree.encode())
        .unwrap();
    builder
        .funcdata(0, FuncdataSlot::StackObjects, objects.encode(ptr))
        .unwrap();
    builder
        .funcdata(0, FuncdataSlot::OpenCodedDeferInfo, defer.encode())
        .unwrap();
    builder.pcdata(12, PcdataChannel::InlTreeIndex, 0).unwrap();
    builder.pcdata(16, PcdataChannel::InlTreeIndex, -1).unwrap();
    builder.go_results_initialized(48).unwrap();
    builder.finish().unwrap()
}

#[test]
fn test_every_table_survives_encoding() {
    for target in [Target::AMD64, Target::ARM64, Target::I386, Target::RISCV64] {
        let mut image = MetadataImage::new(target);
        image.add_function(full_function(target)).unwrap();
        verify_image(&image).unwrap();

        let decoded = MetadataImage::decode(&image.encode()).unwrap();
        assert_eq!(decoded, image);

        let func = decoded.func_by_name("·append").unwrap();
        assert!(func.args_pointer_maps().unwrap().is_some());
        assert!(func.arg_info().unwrap().is_some());
        assert_eq!(func.inline_tree().unwrap().unwrap().len(), 1);
        assert_eq!(func.stack_objects(&target).unwrap().unwrap().len(), 1);
        assert_eq!(
            func.open_coded_defer_info().unwrap().unwrap().defer_bits_offset,
            1
        );
    }
}

#[test]
fn test_arg_info_renders_arguments() {
    let target = Target::AMD64;
    let func = full_function(target);
    let info: ArgInfo = func.arg_info().unwrap().unwrap();

    let mut args = Vec::new();
    for word in [0xc000_0010u64, 0xc000_0100, 3, 8] {
        args.extend_from_slice(&word.to_le_bytes());
    }
    assert_eq!(info.format(&args), "(0xc0000010, {0xc0000100, 0x3, 0x8})");
}

#[test]
fn test_header_is_checked() {
    let image = MetadataImage::new(Target::AMD64);
    let bytes = image.encode();
    assert_eq!(&bytes[..4], b"GCMT");
    assert_eq!(
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        PROTOCOL_VERSION
    );

    assert!(matches!(
        MetadataImage::decode(&bytes[..6]),
        Err(ImageError::DecodeError(_))
    ));
}

#[test]
fn test_truncated_image_is_rejected() {
    let mut image = MetadataImage::new(Target::AMD64);
    image.add_function(full_function(Target::AMD64)).unwrap();
    let bytes = image.encode();
    assert!(MetadataImage::decode(&bytes[..bytes.len() - 3]).is_err());
}

#[test]
fn test_verify_reports_function_name() {
    let mut func = gcmeta::FuncRecord::new("broken", 0x1000, 16);
    func.funcdata[FuncdataSlot::StackObjects.index()] = Some(vec![5]);
    let mut image = MetadataImage::new(Target::AMD64);
    image.add_function(func).unwrap();

    let err = verify_image(&image).unwrap_err();
    assert!(matches!(err, VerifyError::Malformed { .. }));
    assert!(err.to_string().starts_with("broken:"));
}
