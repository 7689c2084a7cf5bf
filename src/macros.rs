macro_rules! assert_let {
    ($pat:pat = $expr:expr => $work:expr) => {
        if let $pat = $expr {
            $work
        } else {
            panic!("assert_let failed");
        }
    };
}

// Evaluates to the first `Some` produced by `$f` over the monitor's state before the timeout,
// otherwise returns `Err($timeout_err)` from the enclosing function.
macro_rules! await_or {
    ($monitor:expr, $timeout:expr, $timeout_err:expr, $f:expr) => {
        match $monitor.wait_for($timeout, $f) {
            Some(x) => x,
            None => return Err($timeout_err),
        }
    };
}

#[test]
fn assert_let() {
    let x = Some(5);
    let z = assert_let![Some(y) = x => {
        println!("{:?}", y);
        3
    }];
    println!("{:?}", z);
}

#[test]
#[should_panic]
fn must_let_panic() {
    let x: Option<u32> = None;
    assert_let![Some(y) = x => {
        println!("{:?}", y);
    }];
}
