// tests/test_queries.rs
// Query dispatch tests over the software reference device: closest and any
// hit, direct and indirect ray counts, visibility masks, and traversal
// stack sizing across growing batches.

use std::sync::Arc;

use glam::{Mat4, Vec3};

use rayforge::calc::software::SoftwareDevice;
use rayforge::calc::{BufferHandle, BufferKind, Device};
use rayforge::scene::{Instance, Mesh, Shape, World};
use rayforge::strategy::records::VertexRecord;
use rayforge::{Error, FatBvhStrategy, Intersection, Ray, HIT, MISS, NULL_ID};

fn triangle_mesh() -> Mesh {
    Mesh::new(
        vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        vec![[0, 1, 2]],
    )
}

fn ready_strategy(world: &World) -> (Arc<SoftwareDevice>, FatBvhStrategy) {
    let device = Arc::new(SoftwareDevice::new());
    let mut strategy = FatBvhStrategy::new(device.clone()).expect("strategy construction");
    strategy.preprocess(world).expect("preprocess");
    (device, strategy)
}

fn upload_rays(device: &SoftwareDevice, rays: &[Ray]) -> BufferHandle {
    device
        .create_buffer_with_data(BufferKind::Read, bytemuck::cast_slice(rays))
        .expect("ray upload")
}

fn hits_buffer(device: &SoftwareDevice, count: usize) -> BufferHandle {
    let init = vec![Intersection::miss(); count];
    device
        .create_buffer_with_data(BufferKind::Write, bytemuck::cast_slice(&init))
        .expect("hit buffer")
}

fn occlusion_buffer(device: &SoftwareDevice, count: usize) -> BufferHandle {
    let init = vec![0i32; count];
    device
        .create_buffer_with_data(BufferKind::Write, bytemuck::cast_slice(&init))
        .expect("occlusion buffer")
}

fn read_intersections(device: &SoftwareDevice, buffer: &BufferHandle) -> Vec<Intersection> {
    let mut bytes = vec![0u8; buffer.size() as usize];
    device.read_buffer(buffer, 0, &mut bytes).expect("readback");
    bytemuck::pod_collect_to_vec(&bytes)
}

fn read_flags(device: &SoftwareDevice, buffer: &BufferHandle) -> Vec<i32> {
    let mut bytes = vec![0u8; buffer.size() as usize];
    device.read_buffer(buffer, 0, &mut bytes).expect("readback");
    bytemuck::pod_collect_to_vec(&bytes)
}

#[test]
fn single_triangle_closest_hit() {
    let mut world = World::new();
    world.attach(Shape::Mesh(Arc::new(triangle_mesh())));
    let (device, strategy) = ready_strategy(&world);

    let rays = upload_rays(&device, &[Ray::new([0.25, 0.25, 1.0], [0.0, 0.0, -1.0], f32::MAX)]);
    let hits = hits_buffer(&device, 1);

    let event = strategy
        .query_intersection(0, &rays, 1, &hits)
        .expect("dispatch");
    event.wait().expect("completion");

    let result = read_intersections(&device, &hits)[0];
    assert_eq!(result.shape_id, 0);
    assert_eq!(result.prim_id, 0);
    assert!((result.uvwt[3] - 1.0).abs() < 1e-5, "t = {}", result.uvwt[3]);
    assert!((result.uvwt[0] - 0.25).abs() < 1e-5);
    assert!((result.uvwt[1] - 0.25).abs() < 1e-5);

    let flags = occlusion_buffer(&device, 1);
    let event = strategy
        .query_occlusion(0, &rays, 1, &flags)
        .expect("dispatch");
    event.wait().expect("completion");
    assert_eq!(read_flags(&device, &flags)[0], HIT);
}

#[test]
fn rays_that_miss_report_the_null_id() {
    let mut world = World::new();
    world.attach(Shape::Mesh(Arc::new(triangle_mesh())));
    let (device, strategy) = ready_strategy(&world);

    let rays = upload_rays(&device, &[Ray::new([5.0, 5.0, 1.0], [0.0, 0.0, -1.0], f32::MAX)]);
    let hits = hits_buffer(&device, 1);
    strategy
        .query_intersection(0, &rays, 1, &hits)
        .expect("dispatch")
        .wait()
        .expect("completion");
    assert_eq!(read_intersections(&device, &hits)[0].shape_id, NULL_ID);

    let flags = occlusion_buffer(&device, 1);
    strategy
        .query_occlusion(0, &rays, 1, &flags)
        .expect("dispatch")
        .wait()
        .expect("completion");
    assert_eq!(read_flags(&device, &flags)[0], MISS);
}

#[test]
fn instanced_geometry_reports_the_instance() {
    let mut world = World::new();
    let mesh = Arc::new(triangle_mesh());
    let mut instance = Instance::new(
        mesh.clone(),
        Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)),
    );
    instance.set_id(1);
    world.attach(Shape::Mesh(mesh));
    world.attach(Shape::Instance(instance));
    let (device, strategy) = ready_strategy(&world);

    let rays = upload_rays(
        &device,
        &[
            Ray::new([0.25, 0.25, 1.0], [0.0, 0.0, -1.0], f32::MAX),
            Ray::new([10.25, 0.25, 1.0], [0.0, 0.0, -1.0], f32::MAX),
        ],
    );
    let hits = hits_buffer(&device, 2);
    strategy
        .query_intersection(0, &rays, 2, &hits)
        .expect("dispatch")
        .wait()
        .expect("completion");

    let results = read_intersections(&device, &hits);
    assert_eq!(results[0].shape_id, 0);
    assert_eq!(results[1].shape_id, 1);
    assert_eq!(results[1].prim_id, 0);
    assert!((results[1].uvwt[3] - 1.0).abs() < 1e-5);

    // The instance's vertices sit translated in the flattened stream right
    // after the base mesh's.
    let view = strategy.scene_view().expect("resident");
    let mut bytes = vec![0u8; view.vertices.size() as usize];
    device.read_buffer(view.vertices, 0, &mut bytes).expect("readback");
    let vertices: Vec<VertexRecord> = bytemuck::pod_collect_to_vec(&bytes);
    assert_eq!(vertices.len(), 6);
    assert_eq!(vertices[3].position, [10.0, 0.0, 0.0]);
    assert_eq!(vertices[4].position, [11.0, 0.0, 0.0]);
    assert_eq!(vertices[5].position, [10.0, 1.0, 0.0]);
}

#[test]
fn closest_and_any_hit_agree_on_classification() {
    let mut world = World::new();
    world.attach(Shape::Mesh(Arc::new(triangle_mesh())));
    let (device, strategy) = ready_strategy(&world);

    let mut rays = Vec::new();
    for j in 0..8 {
        for i in 0..8 {
            let x = i as f32 * 0.2 - 0.3;
            let y = j as f32 * 0.2 - 0.3;
            rays.push(Ray::new([x, y, 1.0], [0.0, 0.0, -1.0], f32::MAX));
        }
    }
    let count = rays.len() as u32;
    let ray_buf = upload_rays(&device, &rays);

    let hits = hits_buffer(&device, rays.len());
    strategy
        .query_intersection(0, &ray_buf, count, &hits)
        .expect("dispatch")
        .wait()
        .expect("completion");
    let closest = read_intersections(&device, &hits);

    let flags = occlusion_buffer(&device, rays.len());
    strategy
        .query_occlusion(0, &ray_buf, count, &flags)
        .expect("dispatch")
        .wait()
        .expect("completion");
    let any = read_flags(&device, &flags);

    let mut hit_count = 0;
    for (closest, any) in closest.iter().zip(&any) {
        assert_eq!(closest.is_hit(), *any == HIT);
        if closest.is_hit() {
            hit_count += 1;
        }
    }
    // The grid straddles the triangle: both hits and misses occur.
    assert!(hit_count > 0 && hit_count < rays.len());
}

#[test]
fn builder_choice_does_not_change_results() {
    let build_world = |sah: bool| {
        let mut world = World::new();
        if sah {
            world.set_option("bvh.builder", "sah");
        }
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for i in 0..16u32 {
            let x = (i % 4) as f32;
            let y = (i / 4) as f32;
            let base = vertices.len() as u32;
            vertices.extend([[x, y, 0.0], [x + 0.9, y, 0.0], [x, y + 0.9, 0.0]]);
            indices.push([base, base + 1, base + 2]);
        }
        world.attach(Shape::Mesh(Arc::new(Mesh::new(vertices, indices))));
        world
    };

    let mut rays = Vec::new();
    for j in 0..10 {
        for i in 0..10 {
            rays.push(Ray::new(
                [i as f32 * 0.45, j as f32 * 0.45, 2.0],
                [0.0, 0.0, -1.0],
                f32::MAX,
            ));
        }
    }

    let run = |sah: bool| {
        let world = build_world(sah);
        let (device, strategy) = ready_strategy(&world);
        let ray_buf = upload_rays(&device, &rays);
        let hits = hits_buffer(&device, rays.len());
        strategy
            .query_intersection(0, &ray_buf, rays.len() as u32, &hits)
            .expect("dispatch")
            .wait()
            .expect("completion");
        read_intersections(&device, &hits)
    };

    let midpoint = run(false);
    let sah = run(true);
    for (a, b) in midpoint.iter().zip(&sah) {
        assert_eq!(a.shape_id, b.shape_id);
        assert_eq!(a.prim_id, b.prim_id);
        assert!((a.uvwt[3] - b.uvwt[3]).abs() < 1e-5);
    }
}

#[test]
fn stack_grows_with_the_batch_and_never_shrinks() {
    let mut world = World::new();
    world.attach(Shape::Mesh(Arc::new(triangle_mesh())));
    let (device, strategy) = ready_strategy(&world);
    assert_eq!(strategy.stack_capacity(), 0);

    let hit_ray = Ray::new([0.25, 0.25, 1.0], [0.0, 0.0, -1.0], f32::MAX);

    let small = vec![hit_ray; 1024];
    let ray_buf = upload_rays(&device, &small);
    let hits = hits_buffer(&device, small.len());
    strategy
        .query_intersection(0, &ray_buf, 1024, &hits)
        .expect("dispatch")
        .wait()
        .expect("completion");
    let after_small = strategy.stack_capacity();
    assert!(after_small >= 4 * 1024 * 48);

    let large = vec![hit_ray; 1_000_000];
    let ray_buf = upload_rays(&device, &large);
    let hits = hits_buffer(&device, large.len());
    strategy
        .query_intersection(0, &ray_buf, 1_000_000, &hits)
        .expect("dispatch")
        .wait()
        .expect("completion");
    let after_large = strategy.stack_capacity();
    assert!(after_large >= 4 * 1_000_000 * 48);
    assert!(after_large > after_small);

    let results = read_intersections(&device, &hits);
    assert_eq!(results[0].shape_id, 0);
    assert_eq!(results[999_999].shape_id, 0);
    assert!((results[999_999].uvwt[3] - 1.0).abs() < 1e-5);

    // A small follow-up batch reuses the grown stack.
    let hits = hits_buffer(&device, small.len());
    let ray_buf = upload_rays(&device, &small);
    strategy
        .query_intersection(0, &ray_buf, 1024, &hits)
        .expect("dispatch")
        .wait()
        .expect("completion");
    assert_eq!(strategy.stack_capacity(), after_large);
}

#[test]
fn indirect_queries_honor_the_count_buffer() {
    let mut world = World::new();
    world.attach(Shape::Mesh(Arc::new(triangle_mesh())));
    let (device, strategy) = ready_strategy(&world);

    let hit_ray = Ray::new([0.25, 0.25, 1.0], [0.0, 0.0, -1.0], f32::MAX);
    let ray_buf = upload_rays(&device, &vec![hit_ray; 4]);
    let count_buf = device
        .create_buffer_with_data(BufferKind::Read, &2u32.to_le_bytes())
        .expect("count buffer");

    // Sentinel records reveal which lanes the kernel touched.
    let sentinel = Intersection {
        shape_id: -42,
        prim_id: -42,
        _pad: [0; 2],
        uvwt: [0.0; 4],
    };
    let hits = device
        .create_buffer_with_data(BufferKind::Write, bytemuck::cast_slice(&[sentinel; 4]))
        .expect("hit buffer");

    strategy
        .query_intersection_indirect(0, &ray_buf, &count_buf, 4, &hits)
        .expect("dispatch")
        .wait()
        .expect("completion");

    let results = read_intersections(&device, &hits);
    assert_eq!(results[0].shape_id, 0);
    assert_eq!(results[1].shape_id, 0);
    assert_eq!(results[2].shape_id, -42);
    assert_eq!(results[3].shape_id, -42);

    let flags = occlusion_buffer(&device, 4);
    strategy
        .query_occlusion_indirect(0, &ray_buf, &count_buf, 4, &flags)
        .expect("dispatch")
        .wait()
        .expect("completion");
    let flags = read_flags(&device, &flags);
    assert_eq!(&flags[..2], &[HIT, HIT]);
    assert_eq!(&flags[2..], &[0, 0]);
}

#[test]
fn queries_without_a_scene_are_rejected() {
    let device = Arc::new(SoftwareDevice::new());
    let strategy = FatBvhStrategy::new(device.clone()).expect("strategy construction");

    let rays = upload_rays(&device, &[Ray::default()]);
    let hits = hits_buffer(&device, 1);
    match strategy.query_intersection(0, &rays, 1, &hits) {
        Err(Error::SceneNotCommitted) => {}
        other => panic!("expected SceneNotCommitted, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn inactive_rays_are_skipped() {
    let mut world = World::new();
    world.attach(Shape::Mesh(Arc::new(triangle_mesh())));
    let (device, strategy) = ready_strategy(&world);

    let mut inactive = Ray::new([0.25, 0.25, 1.0], [0.0, 0.0, -1.0], f32::MAX);
    inactive.active = 0;
    let ray_buf = upload_rays(&device, &[inactive]);

    let sentinel = Intersection {
        shape_id: -42,
        prim_id: -42,
        _pad: [0; 2],
        uvwt: [0.0; 4],
    };
    let hits = device
        .create_buffer_with_data(BufferKind::Write, bytemuck::bytes_of(&sentinel))
        .expect("hit buffer");

    strategy
        .query_intersection(0, &ray_buf, 1, &hits)
        .expect("dispatch")
        .wait()
        .expect("completion");
    assert_eq!(read_intersections(&device, &hits)[0].shape_id, -42);
}

#[test]
fn visibility_masks_filter_hits() {
    let mut world = World::new();
    let mut mesh = triangle_mesh();
    mesh.set_mask(0x1);
    world.attach(Shape::Mesh(Arc::new(mesh)));
    let (device, strategy) = ready_strategy(&world);

    let mut masked = Ray::new([0.25, 0.25, 1.0], [0.0, 0.0, -1.0], f32::MAX);
    masked.mask = 0x2;
    let mut visible = masked;
    visible.mask = 0x3;
    let ray_buf = upload_rays(&device, &[masked, visible]);

    let hits = hits_buffer(&device, 2);
    strategy
        .query_intersection(0, &ray_buf, 2, &hits)
        .expect("dispatch")
        .wait()
        .expect("completion");

    let results = read_intersections(&device, &hits);
    assert_eq!(results[0].shape_id, NULL_ID);
    assert_eq!(results[1].shape_id, 0);
}
