//! End-to-end script execution: source in, captured stdout (or an error)
//! out.

use std::io::Write;
use std::sync::{Arc, Mutex};

use noxy_runtime::{base_session, run_source, NoxyError, Output, Vm};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn try_run(source: &str) -> Result<String, NoxyError> {
    let buf = SharedBuf::default();
    let out: Output = Arc::new(Mutex::new(Box::new(buf.clone())));
    let mut vm = Vm::with_output(out);
    let mut session = base_session();
    let result = run_source(&mut vm, &mut session, source, None, false);
    vm.routines.wait_all();
    result?;
    let bytes = buf.0.lock().unwrap().clone();
    Ok(String::from_utf8(bytes).unwrap())
}

fn run(source: &str) -> String {
    match try_run(source) {
        Ok(output) => output,
        Err(err) => panic!("script failed: {}", err),
    }
}

// ----------------------------------------------------------------------
// The observable scenarios
// ----------------------------------------------------------------------

#[test]
fn test_arithmetic_and_fstring_print() {
    let output = run(
        "func main()\n\
         \tlet x: int = 10\n\
         \tlet y: int = 20\n\
         \tprint(f\"Sum: {x + y}\")\n\
         end\n\
         main()\n",
    );
    assert_eq!(output, "Sum: 30\n");
}

#[test]
fn test_closure_capture() {
    let output = run(
        "func makeAdder(x: int) -> func\n\
         \treturn func(y: int) -> int\n\
         \t\treturn x + y\n\
         \tend\n\
         end\n\
         let add5: func = makeAdder(5)\n\
         print(add5(7))\n",
    );
    assert_eq!(output, "12\n");
}

#[test]
fn test_reference_update_vs_rebind() {
    let output = run(
        "let a: int = 100\n\
         let b: int = 200\n\
         func swap(p: ref int, q: ref int)\n\
         \tlet ta: int = p\n\
         \tlet tb: int = q\n\
         \t*p = tb\n\
         \t*q = ta\n\
         end\n\
         swap(ref a, ref b)\n\
         print(a)\n\
         print(b)\n",
    );
    assert_eq!(output, "200\n100\n");
}

#[test]
fn test_producer_consumer_channel() {
    let output = run(
        "func producer(c: chan int)\n\
         \tlet i: int = 0\n\
         \twhile i < 3 do\n\
         \t\tchan_send(c, i)\n\
         \t\ti = i + 1\n\
         \tend\n\
         \tchan_close(c)\n\
         end\n\
         let c: chan int = make_chan(0)\n\
         spawn(producer, c)\n\
         while true do\n\
         \tlet v: any = chan_recv(c)\n\
         \tif v == null && chan_is_closed(c) then break end\n\
         \tprint(v)\n\
         end\n",
    );
    assert_eq!(output, "0\n1\n2\n");
}

#[test]
fn test_when_select_ready_case() {
    let output = run(
        "let a: chan int = make_chan(1)\n\
         let b: chan int = make_chan(1)\n\
         chan_send(a, 1)\n\
         when\n\
         case x = chan_recv(a) then\n\
         \tprint(f\"a:{x}\")\n\
         case x = chan_recv(b) then\n\
         \tprint(f\"b:{x}\")\n\
         end\n",
    );
    assert_eq!(output, "a:1\n");
}

#[test]
fn test_map_iteration_sums_each_key_once() {
    let output = run(
        "let m: map[string, int] = {\"x\": 1, \"y\": 2}\n\
         let n: int = 0\n\
         for k in m do n = n + m[k] end\n\
         print(n)\n",
    );
    assert_eq!(output, "3\n");
}

// ----------------------------------------------------------------------
// Language behaviors
// ----------------------------------------------------------------------

#[test]
fn test_if_elif_else_chain() {
    let source = "func grade(n: int) -> string\n\
                  \tif n > 89 then\n\
                  \t\treturn \"A\"\n\
                  \telif n > 79 then\n\
                  \t\treturn \"B\"\n\
                  \telse\n\
                  \t\treturn \"C\"\n\
                  \tend\n\
                  end\n\
                  print(grade(95))\n\
                  print(grade(85))\n\
                  print(grade(10))\n";
    assert_eq!(run(source), "A\nB\nC\n");
}

#[test]
fn test_while_break() {
    let output = run(
        "let i: int = 0\n\
         while true do\n\
         \tif i == 3 then break end\n\
         \ti = i + 1\n\
         end\n\
         print(i)\n",
    );
    assert_eq!(output, "3\n");
}

#[test]
fn test_for_over_array() {
    let output = run(
        "let total: int = 0\n\
         for n in [1, 2, 3, 4] do\n\
         \ttotal = total + n\n\
         end\n\
         print(total)\n",
    );
    assert_eq!(output, "10\n");
}

#[test]
fn test_counter_closure_shares_state() {
    let output = run(
        "func makeCounter() -> func\n\
         \tlet n: int = 0\n\
         \treturn func() -> int\n\
         \t\tn = n + 1\n\
         \t\treturn n\n\
         \tend\n\
         end\n\
         let c: func = makeCounter()\n\
         print(c())\n\
         print(c())\n\
         print(c())\n",
    );
    assert_eq!(output, "1\n2\n3\n");
}

#[test]
fn test_ref_survives_scope_exit() {
    // The captured local is promoted to the heap when the frame unwinds;
    // the reference keeps reading the last written value.
    let output = run(
        "func escape() -> ref int\n\
         \tlet x: int = 1\n\
         \tlet r: ref int = ref x\n\
         \tx = 5\n\
         \treturn r\n\
         end\n\
         let r: ref int = escape()\n\
         print(r)\n",
    );
    assert_eq!(output, "5\n");
}

#[test]
fn test_struct_fields_and_ref_links() {
    let output = run(
        "struct Node\n\
         \tvalue: int\n\
         \tnext: ref Node\n\
         end\n\
         let head: Node = Node(1, null)\n\
         let second: Node = Node(2, null)\n\
         head.next = ref second\n\
         let p: ref Node = head.next\n\
         print(p.value)\n\
         print(head.value)\n",
    );
    assert_eq!(output, "2\n1\n");
}

#[test]
fn test_struct_ref_field_update_writes_through() {
    let output = run(
        "struct Holder\n\
         \tslot: ref int\n\
         end\n\
         let x: int = 1\n\
         let h: Holder = Holder(ref x)\n\
         h.slot = 99\n\
         print(x)\n",
    );
    assert_eq!(output, "99\n");
}

#[test]
fn test_nested_function_declaration() {
    let output = run(
        "func outer() -> int\n\
         \tfunc helper(n: int) -> int\n\
         \t\treturn n * 2\n\
         \tend\n\
         \treturn helper(21)\n\
         end\n\
         print(outer())\n",
    );
    assert_eq!(output, "42\n");
}

#[test]
fn test_value_semantics_at_call_boundary() {
    // Arrays passed to non-ref parameters are deep-copied.
    let output = run(
        "func mutate(xs: []int)\n\
         \txs[0] = 99\n\
         end\n\
         let xs: []int = [1, 2]\n\
         mutate(xs)\n\
         print(xs[0])\n",
    );
    assert_eq!(output, "1\n");
}

#[test]
fn test_bytes_zeros_and_indexing() {
    let output = run(
        "let b: bytes = zeros(3)\n\
         b[0] = 65\n\
         print(len(b))\n\
         print(b[0])\n\
         print(b)\n",
    );
    assert_eq!(output, "3\n65\nb\"A\\x00\\x00\"\n");
}

#[test]
fn test_string_concat_and_compare() {
    let output = run(
        "print(\"foo\" + \"bar\")\n\
         print(\"a\" < \"b\")\n\
         print(\"abc\"[1])\n",
    );
    assert_eq!(output, "foobar\ntrue\nb\n");
}

#[test]
fn test_bitwise_and_hex() {
    let output = run(
        "print(0xFF)\n\
         print(5 & 3)\n\
         print(1 << 4)\n\
         print(~0)\n\
         print(12 ^ 10)\n\
         print(64 >> 2)\n",
    );
    assert_eq!(output, "255\n1\n16\n-1\n6\n16\n");
}

#[test]
fn test_float_formatting() {
    let output = run("print(to_str(to_float(\"3.14\")))\nprint(to_str(to_int(\"42\")))\n");
    assert_eq!(output, "3.140000\n42\n");
}

#[test]
fn test_fmt_specifiers() {
    let output = run("print(fmt(\"%05d|%.2f|%x|%t|%q\", 42, 3.14159, 255, true, \"hi\"))\n");
    assert_eq!(output, "00042|3.14|ff|true|\"hi\"\n");
}

#[test]
fn test_fstring_format_specs() {
    let output = run(
        "let n: int = 42\n\
         let x: float = 3.14159\n\
         print(f\"{n:05} {x:.2f}\")\n",
    );
    assert_eq!(output, "00042 3.14\n");
}

#[test]
fn test_json_round_trip_canonicalizes() {
    let output = run(
        "print(json_dumps(json_parse(\"{\\\"b\\\": 1, \\\"a\\\": [1, 2.5, null]}\")))\n",
    );
    assert_eq!(output, "{\"a\":[1,2.5,null],\"b\":1}\n");
}

#[test]
fn test_logical_short_circuit() {
    // The right side of && must not run when the left is false.
    let output = run(
        "func bang() -> bool\n\
         \tprint(\"ran\")\n\
         \treturn true\n\
         end\n\
         if false && bang() then print(\"yes\") else print(\"no\") end\n\
         if true || bang() then print(\"or\") end\n",
    );
    assert_eq!(output, "no\nor\n");
}

#[test]
fn test_any_escape_hatch() {
    let output = run(
        "let v: any = 1\n\
         print(v + 2)\n\
         let m: map[string, any] = {\"k\": [1, 2]}\n\
         print(len(m[\"k\"]))\n",
    );
    assert_eq!(output, "3\n2\n");
}

// ----------------------------------------------------------------------
// Runtime errors
// ----------------------------------------------------------------------

fn run_err(source: &str) -> String {
    match try_run(source) {
        Ok(output) => panic!("expected an error, got output {:?}", output),
        Err(err) => err.to_string(),
    }
}

#[test]
fn test_division_by_zero() {
    assert!(run_err("print(1 / 0)\n").contains("division by zero"));
}

#[test]
fn test_undefined_global() {
    assert!(run_err("print(mystery)\n").contains("undefined global 'mystery'"));
}

#[test]
fn test_index_out_of_range() {
    let message = run_err("let a: []int = [1]\nprint(a[5])\n");
    assert!(message.contains("out of range"));
    assert!(message.contains("[line 2]"));
}

#[test]
fn test_frame_overflow() {
    let message = run_err("func boom()\n\tboom()\nend\nboom()\n");
    assert!(message.contains("call stack overflow"));
}

#[test]
fn test_wrong_argument_count() {
    let message = run_err("func f(a: int)\nend\nlet g: any = f\ng(1, 2)\n");
    assert!(message.contains("expects 1 arguments, got 2"));
}

#[test]
fn test_undefined_property() {
    let message = run_err(
        "struct P\n\tx: int\nend\nlet p: any = P(1)\nprint(p.nope)\n",
    );
    assert!(message.contains("undefined property 'nope'"));
}

#[test]
fn test_send_on_closed_channel() {
    let message = run_err(
        "let c: chan int = make_chan(1)\nchan_close(c)\nchan_send(c, 1)\n",
    );
    assert!(message.contains("channel is closed"));
}

#[test]
fn test_recv_on_closed_empty_channel_yields_null() {
    let output = run(
        "let c: chan int = make_chan(1)\n\
         chan_close(c)\n\
         print(chan_recv(c))\n\
         print(chan_is_closed(c))\n",
    );
    assert_eq!(output, "null\ntrue\n");
}
