//! Routine, channel, wait-group, and select behavior across threads.

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

fn run(source: &str) -> Result<String, NoxyError> {
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

#[test]
fn test_wait_group_fan_out() {
    let output = run(
        "let wg: any = make_wg()\n\
         let c: chan int = make_chan(10)\n\
         func worker(wg: any, c: chan int, id: int)\n\
         \tchan_send(c, id)\n\
         \twg_done(wg)\n\
         end\n\
         wg_add(wg, 3)\n\
         spawn(worker, wg, c, 1)\n\
         spawn(worker, wg, c, 2)\n\
         spawn(worker, wg, c, 3)\n\
         wg_wait(wg)\n\
         let total: int = 0\n\
         let i: int = 0\n\
         while i < 3 do\n\
         \ttotal = total + chan_recv(c)\n\
         \ti = i + 1\n\
         end\n\
         print(total)\n",
    )
    .unwrap();
    assert_eq!(output, "6\n");
}

#[test]
fn test_when_default_is_non_blocking() {
    let output = run(
        "let a: chan int = make_chan(0)\n\
         when\n\
         case x = chan_recv(a) then\n\
         \tprint(x)\n\
         default\n\
         \tprint(\"empty\")\n\
         end\n",
    )
    .unwrap();
    assert_eq!(output, "empty\n");
}

#[test]
fn test_when_send_case() {
    let output = run(
        "let a: chan int = make_chan(1)\n\
         when\n\
         case chan_send(a, 5) then\n\
         \tprint(\"sent\")\n\
         default\n\
         \tprint(\"full\")\n\
         end\n\
         print(chan_recv(a))\n",
    )
    .unwrap();
    assert_eq!(output, "sent\n5\n");
}

#[test]
fn test_when_blocks_until_routine_sends() {
    let output = run(
        "func delayed(c: chan int)\n\
         \tsleep(20)\n\
         \tchan_send(c, 7)\n\
         end\n\
         let c: chan int = make_chan(0)\n\
         spawn(delayed, c)\n\
         when\n\
         case x = chan_recv(c) then\n\
         \tprint(x)\n\
         end\n",
    )
    .unwrap();
    assert_eq!(output, "7\n");
}

#[test]
fn test_when_ok_false_on_closed_channel() {
    // A receive case on a closed, drained channel fires with a null value
    // rather than blocking forever.
    let output = run(
        "let c: chan int = make_chan(1)\n\
         chan_close(c)\n\
         when\n\
         case x = chan_recv(c) then\n\
         \tprint(x)\n\
         end\n",
    )
    .unwrap();
    assert_eq!(output, "null\n");
}

#[test]
fn test_timeout_pattern() {
    // The documented timeout idiom: a timer routine racing the work
    // channel inside `when`.
    let output = run(
        "func timer(c: chan int)\n\
         \tsleep(10)\n\
         \tchan_send(c, 0)\n\
         end\n\
         let work: chan int = make_chan(0)\n\
         let timeout: chan int = make_chan(0)\n\
         spawn(timer, timeout)\n\
         when\n\
         case x = chan_recv(work) then\n\
         \tprint(\"work\")\n\
         case x = chan_recv(timeout) then\n\
         \tprint(\"timeout\")\n\
         end\n",
    )
    .unwrap();
    assert_eq!(output, "timeout\n");
}

#[test]
fn test_routine_error_does_not_kill_host() {
    // The routine divides by zero; the host VM keeps running and the
    // script completes normally.
    let output = run(
        "func bad(c: chan int)\n\
         \tchan_send(c, 1)\n\
         \tprint(1 / 0)\n\
         end\n\
         let c: chan int = make_chan(0)\n\
         spawn(bad, c)\n\
         print(chan_recv(c))\n\
         print(\"alive\")\n",
    )
    .unwrap();
    assert_eq!(output, "1\nalive\n");
}

#[test]
fn test_routines_share_globals() {
    let output = run(
        "let done: chan int = make_chan(0)\n\
         let shared: map[string, int] = {\"hits\": 0}\n\
         func bump(done: chan int, m: map[string, int])\n\
         \tm[\"hits\"] = m[\"hits\"] + 1\n\
         \tchan_send(done, 1)\n\
         end\n\
         spawn(bump, done, ref shared)\n\
         chan_recv(done)\n\
         print(shared[\"hits\"])\n",
    )
    .unwrap();
    assert_eq!(output, "1\n");
}

#[test]
fn test_many_messages_in_order() {
    let output = run(
        "func producer(c: chan int)\n\
         \tlet i: int = 0\n\
         \twhile i < 50 do\n\
         \t\tchan_send(c, i)\n\
         \t\ti = i + 1\n\
         \tend\n\
         \tchan_close(c)\n\
         end\n\
         let c: chan int = make_chan(4)\n\
         spawn(producer, c)\n\
         let total: int = 0\n\
         while true do\n\
         \tlet v: any = chan_recv(c)\n\
         \tif v == null && chan_is_closed(c) then break end\n\
         \ttotal = total + v\n\
         end\n\
         print(total)\n",
    )
    .unwrap();
    assert_eq!(output, "1225\n");
}
