//! End-to-end session behaviour: lifecycle, placement, executors, patterns, failures.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strata_runtime::graph::memcpy::{MEMCPY_FROM_HOST, MEMCPY_TO_HOST};
use strata_runtime::graph::{AttributeValue, GraphTransformer, MemcpyTransformer};
use strata_runtime::memory::ArenaConfig;
use strata_runtime::{
    select_backends, ElementType, Graph, InferenceSession, JsonModel, KernelContext, KernelDef,
    KernelRegistry, NodeArg, OpKernel, RunOptions, RuntimeError, SessionOptions, Tensor, Value,
};

fn feeds(pairs: &[(&str, Tensor)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(name, t)| (name.to_string(), Value::from_tensor(t).unwrap()))
        .collect()
}

fn output(out: &HashMap<String, Value>, name: &str) -> Tensor {
    out[name].to_tensor().unwrap()
}

/// A(x) -> B -> C(y): Relu, Mul by an initializer, Scale by 0.5.
fn chain(b_backend: &str) -> Graph {
    let mut g = Graph::new("chain");
    g.add_input(NodeArg::typed("x", ElementType::F32, &[4]));
    g.add_initializer("w", Tensor::new(vec![4], vec![1.0, 2.0, 3.0, 4.0]));
    g.add_node("A", "Relu", &["x"], &["t"]);
    let b = g.add_node("B", "Mul", &["t", "w"], &["u"]);
    let c = g.add_node("C", "Scale", &["u"], &["y"]);
    g.node_mut(b).unwrap().backend = b_backend.to_string();
    g.node_mut(c)
        .unwrap()
        .attributes
        .insert("factor".into(), AttributeValue::Float(0.5));
    for name in ["t", "u", "y"] {
        g.set_node_arg(NodeArg::typed(name, ElementType::F32, &[4]));
    }
    g.add_output("y");
    g
}

fn chain_feeds() -> HashMap<String, Value> {
    feeds(&[("x", Tensor::new(vec![4], vec![1.0, -2.0, 3.0, -4.0]))])
}

fn session_with(options: SessionOptions, graph: Graph) -> InferenceSession {
    let session = InferenceSession::new(options).unwrap();
    session.load(graph).unwrap();
    session.initialize().unwrap();
    session
}

/// Copies its input once the test lets it through.
struct Gate {
    release: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl OpKernel for Gate {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
        let _ = self.release.lock().unwrap().recv();
        let x = ctx.input(0)?.clone();
        let out = ctx.output(0, x.dtype(), x.shape())?;
        out.data_mut()?.copy_from_slice(x.data());
        Ok(())
    }
}

fn gated_session() -> (InferenceSession, mpsc::Sender<()>) {
    let (tx, rx) = mpsc::channel();
    let release = Arc::new(Mutex::new(rx));
    let mut g = Graph::new("gated");
    g.add_input(NodeArg::new("x"));
    g.add_node("gate", "Gate", &["x"], &["y"]);
    g.add_output("y");
    let session = InferenceSession::new(SessionOptions::default()).unwrap();
    session
        .register_kernel(KernelDef::new("Gate", "cpu"), move |_| {
            Ok(Box::new(Gate {
                release: Arc::clone(&release),
            }))
        })
        .unwrap();
    session.load(g).unwrap();
    session.initialize().unwrap();
    (session, tx)
}

#[test]
fn test_chain_on_host() {
    let session = session_with(SessionOptions::default(), chain(""));
    let out = session
        .run(&RunOptions::sequential(), chain_feeds(), &["y".to_string()])
        .unwrap();
    assert_eq!(output(&out, "y").as_f32(), &[0.5, 0.0, 4.5, 0.0]);
    assert_eq!(session.current_num_runs(), 0);
}

#[test]
fn test_run_counter_during_run() {
    let (session, release) = gated_session();
    assert_eq!(session.current_num_runs(), 0);
    std::thread::scope(|s| {
        let handle = s.spawn(|| {
            session.run(
                &RunOptions::default(),
                feeds(&[("x", Tensor::new(vec![2], vec![1.0, 2.0]))]),
                &[],
            )
        });
        let deadline = Instant::now() + Duration::from_secs(10);
        while session.current_num_runs() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(session.current_num_runs(), 1);
        release.send(()).unwrap();
        let out = handle.join().unwrap().unwrap();
        assert_eq!(output(&out, "y").as_f32(), &[1.0, 2.0]);
    });
    assert_eq!(session.current_num_runs(), 0);
}

#[test]
fn test_device_segment_gets_two_copies() {
    let options = SessionOptions {
        backends: vec!["cpu".into(), "emulated".into()],
        ..Default::default()
    };
    let session = session_with(options, chain("emulated"));
    let placed = session.graph().unwrap();
    let count = |op: &str| placed.nodes().filter(|n| n.op_type == op).count();
    assert_eq!(count(MEMCPY_FROM_HOST), 1);
    assert_eq!(count(MEMCPY_TO_HOST), 1);
    assert_eq!(placed.initializers().len(), 1);
    assert_eq!(placed.find_node("A").unwrap().backend, "cpu");
    assert_eq!(placed.find_node("B").unwrap().backend, "emulated");

    for run_options in [RunOptions::sequential(), RunOptions::parallel()] {
        let out = session.run(&run_options, chain_feeds(), &[]).unwrap();
        let y = out["y"].as_tensor().unwrap();
        assert!(y.location().is_cpu());
        assert_eq!(y.as_f32().unwrap(), &[0.5, 0.0, 4.5, 0.0]);
    }
}

#[test]
fn test_placement_pass_is_idempotent() {
    let backends = select_backends(&["emulated".to_string()]);
    let mut kernels = KernelRegistry::new();
    for backend in &backends {
        backend.register_kernels(&mut kernels);
    }
    let options = SessionOptions {
        backends: vec!["cpu".into(), "emulated".into()],
        ..Default::default()
    };
    let session = session_with(options, chain("emulated"));
    let mut placed = session.graph().unwrap();
    let pass = MemcpyTransformer::new("emulated", "cpu", &kernels);
    assert!(!pass.apply(&mut placed).unwrap());
}

#[test]
fn test_run_before_load_or_initialize() {
    let session = InferenceSession::new(SessionOptions::default()).unwrap();
    assert!(matches!(
        session.run(&RunOptions::default(), chain_feeds(), &[]),
        Err(RuntimeError::NotLoaded)
    ));
    session.load(chain("")).unwrap();
    assert!(matches!(
        session.run(&RunOptions::default(), chain_feeds(), &[]),
        Err(RuntimeError::NotInitialized)
    ));
    assert_eq!(session.current_num_runs(), 0);
}

#[test]
fn test_sequential_and_parallel_agree() {
    // Two branches off x that meet again, with a softmax and a matmul on the way.
    let mut g = Graph::new("diamond");
    g.add_input(NodeArg::typed("x", ElementType::F32, &[2, 3]));
    g.add_initializer("w", Tensor::new(vec![3, 2], vec![0.5, -1.0, 2.0, 0.25, -0.75, 1.5]));
    g.add_initializer("bias", Tensor::new(vec![3], vec![0.1, 0.2, 0.3]));
    g.add_node("left", "Softmax", &["x"], &["l"]);
    g.add_node("right", "Gelu", &["x"], &["r"]);
    g.add_node("right_bias", "Add", &["r", "bias"], &["rb"]);
    g.add_node("join", "Mul", &["l", "rb"], &["j"]);
    g.add_node("proj", "MatMul", &["j", "w"], &["y"]);
    g.add_node("side", "Tanh", &["rb"], &["z"]);
    g.add_output("y");
    g.add_output("z");
    let session = session_with(SessionOptions::default(), g);

    let x = Tensor::new(vec![2, 3], vec![0.3, -1.2, 2.5, 0.0, 0.7, -0.4]);
    let seq = session
        .run(&RunOptions::sequential(), feeds(&[("x", x.clone())]), &[])
        .unwrap();
    let par = session
        .run(&RunOptions::parallel(), feeds(&[("x", x)]), &[])
        .unwrap();
    for name in ["y", "z"] {
        let a = output(&seq, name);
        let b = output(&par, name);
        assert_eq!(a.shape(), b.shape());
        assert_eq!(a.to_bytes(), b.to_bytes(), "output {} differs", name);
    }
    assert_eq!(output(&seq, "y").shape(), &[2, 2]);
}

#[test]
fn test_timeout_returns_counter_to_zero() {
    let (session, release) = gated_session();
    let result = session.run(
        &RunOptions::default().with_timeout(50),
        feeds(&[("x", Tensor::new(vec![1], vec![1.0]))]),
        &[],
    );
    assert!(matches!(result, Err(RuntimeError::Timeout(50))));
    assert_eq!(session.current_num_runs(), 0);
    // Let the abandoned job drain.
    release.send(()).unwrap();
}

#[test]
fn test_memory_pattern_per_feed_shape() {
    let mut g = Graph::new("untyped");
    g.add_input(NodeArg::new("x"));
    g.add_node("a", "Relu", &["x"], &["t"]);
    g.add_node("b", "Scale", &["t"], &["u"]);
    g.add_node("c", "Add", &["u", "t"], &["y"]);
    g.add_output("y");
    let session = session_with(SessionOptions::default(), g);

    let run = |n: usize| {
        let data: Vec<f32> = (0..n).map(|i| i as f32 - 2.0).collect();
        let out = session
            .run(&RunOptions::sequential(), feeds(&[("x", Tensor::new(vec![n], data.clone()))]), &[])
            .unwrap();
        let expected: Vec<f32> = data.iter().map(|v| 2.0 * v.max(0.0)).collect();
        assert_eq!(output(&out, "y").as_f32(), expected.as_slice());
    };
    assert_eq!(session.num_memory_patterns(), 0);
    run(4);
    assert_eq!(session.num_memory_patterns(), 1);
    run(4);
    assert_eq!(session.num_memory_patterns(), 1);
    run(9);
    assert_eq!(session.num_memory_patterns(), 2);
    run(9);
    assert_eq!(session.num_memory_patterns(), 2);
}

/// Hands its input buffer on as the output.
struct View;

impl OpKernel for View {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), RuntimeError> {
        let x = ctx.input(0)?.clone();
        ctx.alias_output(0, x.dtype(), x.shape(), Arc::clone(x.buffer()))
    }
}

#[test]
fn test_in_place_output_survives_pattern_replay() {
    let mut g = Graph::new("in-place");
    g.add_input(NodeArg::new("x"));
    g.add_node("relu", "Relu", &["x"], &["a"]);
    g.add_node("view", "View", &["a"], &["b"]);
    let scale = g.add_node("scale", "Scale", &["b"], &["c"]);
    g.node_mut(scale)
        .unwrap()
        .attributes
        .insert("factor".into(), AttributeValue::Float(2.0));
    g.add_node("sum", "Add", &["b", "c"], &["y"]);
    g.add_output("y");

    let session = InferenceSession::new(SessionOptions::default()).unwrap();
    session
        .register_kernel(KernelDef::new("View", "cpu"), |_| Ok(Box::new(View)))
        .unwrap();
    session.load(g).unwrap();
    session.initialize().unwrap();

    let x = || feeds(&[("x", Tensor::new(vec![4], vec![1.0, 2.0, 3.0, 4.0]))]);
    let recorded = session.run(&RunOptions::sequential(), x(), &[]).unwrap();
    assert_eq!(session.num_memory_patterns(), 1);
    let replayed = session.run(&RunOptions::sequential(), x(), &[]).unwrap();
    let parallel = session.run(&RunOptions::parallel(), x(), &[]).unwrap();
    for out in [&recorded, &replayed, &parallel] {
        assert_eq!(output(out, "y").as_f32(), &[3.0, 6.0, 9.0, 12.0]);
    }
}

#[test]
fn test_zero_element_tensors_run() {
    let mut g = Graph::new("empty");
    g.add_input(NodeArg::new("x"));
    g.add_node("r", "Relu", &["x"], &["t"]);
    g.add_node("s", "Scale", &["t"], &["y"]);
    g.add_output("y");
    let session = session_with(SessionOptions::default(), g);
    for run_options in [RunOptions::sequential(), RunOptions::parallel()] {
        let out = session
            .run(&run_options, feeds(&[("x", Tensor::zeros(&[0, 4]))]), &[])
            .unwrap();
        let y = output(&out, "y");
        assert_eq!(y.shape(), &[0, 4]);
        assert!(y.as_f32().is_empty());
    }
}

#[test]
fn test_concurrent_runs_share_session() {
    let mut g = Graph::new("untyped");
    g.add_input(NodeArg::new("x"));
    g.add_node("a", "Relu", &["x"], &["t"]);
    g.add_node("b", "Scale", &["t"], &["u"]);
    g.add_node("c", "Add", &["u", "t"], &["y"]);
    g.add_output("y");
    let session = session_with(SessionOptions::default(), g);

    let sizes = [3usize, 5, 8];
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let session = &session;
                s.spawn(move || {
                    let n = sizes[worker % sizes.len()];
                    let run_options = if worker % 2 == 0 {
                        RunOptions::sequential()
                    } else {
                        RunOptions::parallel()
                    };
                    for round in 0..10 {
                        let data: Vec<f32> =
                            (0..n).map(|i| (worker * 100 + round * 10 + i) as f32 - 4.0).collect();
                        let out = session
                            .run(&run_options, feeds(&[("x", Tensor::new(vec![n], data.clone()))]), &[])
                            .unwrap();
                        let expected: Vec<f32> = data.iter().map(|v| 2.0 * v.max(0.0)).collect();
                        assert_eq!(output(&out, "y").as_f32(), expected.as_slice());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });
    assert_eq!(session.current_num_runs(), 0);
    // Sequential workers 0, 2, 4 and 6 cover every size.
    assert_eq!(session.num_memory_patterns(), sizes.len());
}

#[test]
fn test_memory_pattern_disabled() {
    let options = SessionOptions {
        enable_mem_pattern: false,
        ..Default::default()
    };
    let session = session_with(options, chain(""));
    session.run(&RunOptions::sequential(), chain_feeds(), &[]).unwrap();
    assert_eq!(session.num_memory_patterns(), 0);
}

#[test]
fn test_kernel_failure_leaves_session_usable() {
    let mut g = Graph::new("add");
    g.add_input(NodeArg::new("a"));
    g.add_input(NodeArg::new("b"));
    g.add_node("sum", "Add", &["a", "b"], &["y"]);
    g.add_output("y");
    let session = session_with(SessionOptions::default(), g);

    for run_options in [RunOptions::sequential(), RunOptions::parallel()] {
        let bad = feeds(&[
            ("a", Tensor::new(vec![4], vec![1.0; 4])),
            ("b", Tensor::new(vec![3], vec![1.0; 3])),
        ]);
        match session.run(&run_options, bad, &[]) {
            Err(RuntimeError::ExecutionFailure { node, op_type, .. }) => {
                assert_eq!(node, "sum");
                assert_eq!(op_type, "Add");
            }
            other => panic!("expected ExecutionFailure, got {:?}", other.map(|_| ())),
        }
        let good = feeds(&[
            ("a", Tensor::new(vec![2], vec![1.0, 2.0])),
            ("b", Tensor::new(vec![2], vec![3.0, 4.0])),
        ]);
        let out = session.run(&run_options, good, &[]).unwrap();
        assert_eq!(output(&out, "y").as_f32(), &[4.0, 6.0]);
    }
    assert_eq!(session.current_num_runs(), 0);
}

#[test]
fn test_out_of_memory_is_reported() {
    let options = SessionOptions {
        arena: ArenaConfig {
            initial_chunk_bytes: 1024,
            max_mem: 1024,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut g = Graph::new("relu");
    g.add_input(NodeArg::new("x"));
    g.add_node("r", "Relu", &["x"], &["y"]);
    g.add_output("y");
    let session = session_with(options, g);
    let big = feeds(&[("x", Tensor::zeros(&[1024]))]);
    match session.run(&RunOptions::sequential(), big, &[]) {
        Err(RuntimeError::ExecutionFailure { source, .. }) => {
            assert!(matches!(*source, RuntimeError::OutOfMemory { .. }), "{:?}", source);
        }
        other => panic!("expected ExecutionFailure, got {:?}", other.map(|_| ())),
    }
    let small = feeds(&[("x", Tensor::new(vec![2], vec![-1.0, 1.0]))]);
    let out = session.run(&RunOptions::sequential(), small, &[]).unwrap();
    assert_eq!(output(&out, "y").as_f32(), &[0.0, 1.0]);
}

#[test]
fn test_json_model_from_file() {
    let model = r#"{
        "name": "json-chain",
        "inputs": [{"name": "x", "dtype": "f32", "shape": [4]}],
        "outputs": ["y"],
        "initializers": [{"name": "w", "dtype": "f32", "shape": [4], "data": [1, 2, 3, 4]}],
        "nodes": [
            {"name": "A", "op_type": "Relu", "inputs": ["x"], "outputs": ["t"]},
            {"name": "B", "op_type": "Mul", "inputs": ["t", "w"], "outputs": ["u"],
             "backend": "emulated"},
            {"name": "C", "op_type": "Scale", "inputs": ["u"], "outputs": ["y"],
             "attributes": {"factor": 0.5}}
        ]
    }"#;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    std::fs::write(&path, model).unwrap();

    let options = SessionOptions {
        backends: vec!["cpu".into(), "emulated".into()],
        ..Default::default()
    };
    let session = InferenceSession::new(options).unwrap();
    session.load_from_file(&path).unwrap();
    assert_eq!(session.input_names().unwrap(), vec!["x"]);
    session.initialize().unwrap();
    let out = session.run(&RunOptions::default(), chain_feeds(), &[]).unwrap();
    assert_eq!(output(&out, "y").as_f32(), &[0.5, 0.0, 4.5, 0.0]);

    assert!(JsonModel::from_file(&dir.path().join("absent.json")).is_err());
}
